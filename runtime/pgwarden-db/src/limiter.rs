//! Result-size capping.

/// Keep the first `max_rows` rows, returning them with the number of rows
/// the database actually produced.
pub fn limit_rows<T>(mut rows: Vec<T>, max_rows: usize) -> (Vec<T>, usize) {
    let total_count = rows.len();
    if total_count > max_rows {
        tracing::debug!(total_count, max_rows, "truncating result set");
        rows.truncate(max_rows);
    }
    (rows, total_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_limit_is_unchanged() {
        let (rows, total) = limit_rows(vec![1, 2, 3], 5);
        assert_eq!(rows, vec![1, 2, 3]);
        assert_eq!(total, 3);

        let (rows, total) = limit_rows(vec![1, 2, 3], 3);
        assert_eq!(rows, vec![1, 2, 3]);
        assert_eq!(total, 3);
    }

    #[test]
    fn over_limit_keeps_prefix_and_total() {
        let input: Vec<u32> = (0..100).collect();
        let (rows, total) = limit_rows(input.clone(), 10);
        assert_eq!(rows.len(), 10);
        assert_eq!(rows, &input[..10]);
        assert_eq!(total, 100);
    }

    #[test]
    fn empty_and_zero_limits() {
        let (rows, total) = limit_rows(Vec::<u8>::new(), 10);
        assert!(rows.is_empty());
        assert_eq!(total, 0);

        let (rows, total) = limit_rows(vec!['a', 'b'], 0);
        assert!(rows.is_empty());
        assert_eq!(total, 2);
    }
}
