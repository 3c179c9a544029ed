use rayon::prelude::*;

/// Indexed parallel mutation over one slice.
pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

/// Run the two branches of a divide-and-conquer step, in parallel when the
/// partition is worth a steal.
pub fn maybe_join<A, B>(parallel: bool, a: A, b: B)
where
    A: FnOnce() + Send,
    B: FnOnce() + Send,
{
    if parallel {
        rayon::join(a, b);
    } else {
        a();
        b();
    }
}
