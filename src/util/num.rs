/// Round up `n` to the nearest `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}
