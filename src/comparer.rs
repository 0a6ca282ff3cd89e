//! STRATA - Key Ordering
//! Every segment of an engine orders its keys through one shared comparer.

use std::cmp::Ordering;
use std::sync::Arc;

/// Total order over keys.
pub trait RefComparer<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalComparer;

impl<K: Ord> RefComparer<K> for NaturalComparer {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Wraps a closure as a comparer.
pub struct FnComparer<F>(pub F);

impl<K, F> RefComparer<K> for FnComparer<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

/// Shared comparer handle.
pub type SharedComparer<K> = Arc<dyn RefComparer<K>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_comparer() {
        let c = NaturalComparer;
        assert_eq!(RefComparer::<i32>::compare(&c, &1, &2), Ordering::Less);
        assert_eq!(RefComparer::<i32>::compare(&c, &2, &2), Ordering::Equal);
    }

    #[test]
    fn test_fn_comparer_reverses() {
        let c: SharedComparer<i32> = Arc::new(FnComparer(|a: &i32, b: &i32| b.cmp(a)));
        assert_eq!(c.compare(&1, &2), Ordering::Greater);
    }
}
