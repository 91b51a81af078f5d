/// Run `f` on a path the optimizer should treat as unlikely (allocation
/// failure, refused releases...)
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
