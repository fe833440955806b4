pub const fn ceil_divide(target: usize, granularity: usize) -> usize {
    (target + granularity - 1) / granularity
}

#[cfg(test)]
mod tests {
    use super::ceil_divide;

    #[test]
    fn rounds_up() {
        assert_eq!(ceil_divide(25, 8), 4);
        assert_eq!(ceil_divide(24, 8), 3);
        assert_eq!(ceil_divide(1, 64), 1);
    }
}
