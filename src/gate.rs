//! Top-level memoization gate.
//!
//! A [`Gate`] wraps a whole computation. When the props handed to it compare
//! equal to the props of the previous call on the same [`Memory`], it returns
//! the previous result without walking the memory at all. Otherwise it runs a
//! full pass, in which the primitives still reuse whatever they can.

use std::any::Any;
use std::rc::Rc;

use crate::cx::Cx;
use crate::memory::Memory;
use crate::tracer::CacheCheck;

/// Function type for comparing props.
pub type PropsComparator<P> = Rc<dyn Fn(&P, &P) -> bool>;

/// A computation `body(cx, props) -> R` memoized on its props.
///
/// The gate holds no state itself; the last props and result live in the
/// memory passed to [`run`](Gate::run). One gate can serve many memories.
///
/// # Example
///
/// ```
/// use graft_flow::{Gate, Memory};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let runs = Rc::new(Cell::new(0));
/// let counter = runs.clone();
/// let square = Gate::new(move |_cx, x: &i64| {
///     counter.set(counter.get() + 1);
///     x * x
/// });
///
/// let mut memory = Memory::new();
/// assert_eq!(square.run(&mut memory, 3), 9);
/// assert_eq!(square.run(&mut memory, 3), 9);
/// assert_eq!(runs.get(), 1);
/// ```
pub struct Gate<P, R> {
    body: Rc<dyn Fn(&mut Cx<'_>, &P) -> R>,
    props_eq: PropsComparator<P>,
}

impl<P, R> Clone for Gate<P, R> {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
            props_eq: self.props_eq.clone(),
        }
    }
}

impl<P, R> Gate<P, R>
where
    P: 'static,
    R: Clone + 'static,
{
    /// Gate `body` on `PartialEq` of its props.
    ///
    /// Field types decide the policy: plain data compares by value, while
    /// [`ByRef`](crate::ByRef) and [`SyncPromise`](crate::SyncPromise) fields
    /// compare by identity.
    pub fn new(body: impl Fn(&mut Cx<'_>, &P) -> R + 'static) -> Self
    where
        P: PartialEq,
    {
        Self::with_props_eq(body, |a: &P, b: &P| a == b)
    }

    /// Gate `body` with a custom props comparison.
    pub fn with_props_eq(
        body: impl Fn(&mut Cx<'_>, &P) -> R + 'static,
        props_eq: impl Fn(&P, &P) -> bool + 'static,
    ) -> Self {
        Self {
            body: Rc::new(body),
            props_eq: Rc::new(props_eq),
        }
    }

    /// Return the cached result if `props` equals the last props seen by
    /// `memory`, otherwise run a pass and cache the new result.
    pub fn run(&self, memory: &mut Memory, props: P) -> R {
        if let Some(result) = self.cached(memory, &props) {
            memory.env.tracer.on_gate_check(CacheCheck::Hit);
            return result;
        }
        let check = if memory.gate.is_some() {
            CacheCheck::Miss
        } else {
            CacheCheck::Fresh
        };
        memory.env.tracer.on_gate_check(check);

        let result = memory.run(|cx| (self.body)(cx, &props));
        memory.gate = Some(Box::new(GateEntry {
            props,
            result: result.clone(),
        }) as Box<dyn Any>);
        result
    }

    fn cached(&self, memory: &Memory, props: &P) -> Option<R> {
        let entry = memory.gate.as_ref()?.downcast_ref::<GateEntry<P, R>>()?;
        (self.props_eq)(&entry.props, props).then(|| entry.result.clone())
    }
}

struct GateEntry<P, R> {
    props: P,
    result: R,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_custom_props_eq() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        // Only the first field matters.
        let gate = Gate::with_props_eq(
            move |_cx, props: &(i32, i32)| {
                counter.set(counter.get() + 1);
                props.0
            },
            |a, b| a.0 == b.0,
        );
        let mut memory = Memory::new();
        assert_eq!(gate.run(&mut memory, (1, 1)), 1);
        assert_eq!(gate.run(&mut memory, (1, 2)), 1);
        assert_eq!(runs.get(), 1);
        assert_eq!(gate.run(&mut memory, (2, 2)), 2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_result_type_change_reruns() {
        let mut memory = Memory::new();
        let numbers = Gate::new(|_cx, x: &i32| *x);
        let strings = Gate::new(|_cx, x: &i32| x.to_string());
        assert_eq!(numbers.run(&mut memory, 1), 1);
        assert_eq!(strings.run(&mut memory, 1), "1");
    }

    #[test]
    fn test_gate_caches_in_memory() {
        let gate = Gate::new(|cx, x: &u8| cx.memo(*x, |_| *x as u32 * 2));
        let mut memory = Memory::new();
        assert!(!memory.has_gate_result());
        gate.run(&mut memory, 4);
        assert!(memory.has_gate_result());
        assert!(memory.snapshot().gated);
    }
}
