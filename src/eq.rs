//! Equality helpers for dependency keys, dedupe and gate policies.
//!
//! Dependencies passed to [`Cx::memo`](crate::Cx::memo) are compared with
//! `PartialEq`. Tuples compare elementwise, so `(a, b)` behaves like a
//! dependency array. Wrap a shared value in [`ByRef`] to compare that element
//! by identity instead of by content.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

/// An equality function, as accepted by `dedupe` and `memo_with`.
pub type EqFn<T> = fn(&T, &T) -> bool;

/// Identity comparison for reference-counted values.
pub fn ref_eq<T: ?Sized>(a: &Rc<T>, b: &Rc<T>) -> bool {
    Rc::ptr_eq(a, b)
}

/// Compare two slices elementwise with `eq`.
pub fn slice_eq_with<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq(x, y))
}

/// Compare two maps entry by entry with `eq`, ignoring insertion order.
pub fn map_eq_with<K, V>(
    a: &indexmap::IndexMap<K, V>,
    b: &indexmap::IndexMap<K, V>,
    eq: impl Fn(&V, &V) -> bool,
) -> bool
where
    K: std::hash::Hash + Eq,
{
    a.len() == b.len()
        && a.iter()
            .all(|(key, x)| b.get(key).is_some_and(|y| eq(x, y)))
}

/// A shared value compared by identity rather than by content.
///
/// Two `ByRef`s are equal only if they point at the same allocation, which is
/// the equality a dependency list needs for values that are rebuilt rather than
/// mutated.
pub struct ByRef<T: ?Sized>(pub Rc<T>);

impl<T> ByRef<T> {
    /// Allocate a new value.
    pub fn new(value: T) -> Self {
        ByRef(Rc::new(value))
    }
}

impl<T: ?Sized> Clone for ByRef<T> {
    fn clone(&self) -> Self {
        ByRef(Rc::clone(&self.0))
    }
}

impl<T: ?Sized> PartialEq for ByRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: ?Sized> Eq for ByRef<T> {}

impl<T: ?Sized> Deref for ByRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> From<Rc<T>> for ByRef<T> {
    fn from(rc: Rc<T>) -> Self {
        ByRef(rc)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ByRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByRef({:?})", &*self.0)
    }
}
