//////////////////
// VECTOR STUFF //
//////////////////

/// Get the sorted, de-duplicated elements of a string slice
///
/// ### Params
///
/// * `x` - The string slice.
///
/// ### Returns
///
/// The unique strings in lexicographic order
pub fn unique_sorted<S: AsRef<str>>(x: &[S]) -> Vec<String> {
    let mut res: Vec<String> = x.iter().map(|s| s.as_ref().to_string()).collect();
    res.sort_unstable();
    res.dedup();
    res
}

/// Does the slice hold at least two distinct values
pub fn has_variation(x: &[f64]) -> bool {
    match x.first() {
        Some(first) => x.iter().any(|v| (v - first).abs() > 1e-12 * first.abs().max(1.0)),
        None => false,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_sorted() {
        let x = vec!["b", "a", "b", "c", "a"];
        assert_eq!(unique_sorted(&x), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_has_variation() {
        assert!(!has_variation(&[1.0, 1.0, 1.0]));
        assert!(has_variation(&[1.0, 1.0, 2.0]));
        assert!(!has_variation(&[]));
    }
}
