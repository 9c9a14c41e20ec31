/// Apply `${VAR:offset[:length]}` slicing to an already-resolved value.
///
/// A positive offset drops that many characters from the start; a negative
/// offset keeps characters counting from the end. `length` defaults to the
/// remainder of the string (or to `|offset|` for a negative offset).
/// Out-of-range offsets clamp, over-long lengths shorten, negative lengths
/// yield the empty string.
pub fn slice_str(value: &str, offset: i64, length: Option<i64>) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len() as i64;

    let mut offset = offset;
    let mut length = match length {
        Some(l) => l,
        None if offset >= 0 => len - offset,
        None => offset.abs(),
    };

    if offset.abs() > len {
        offset = if offset >= 0 { len } else { -len };
    }
    if (offset < 0 && length > -offset) || (offset >= 0 && offset + length > len) {
        length = if offset >= 0 { len - offset } else { len + offset };
    }
    if length <= 0 {
        return String::new();
    }

    let start = if offset >= 0 { offset } else { len + offset } as usize;
    chars[start..start + length as usize].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_offset_with_length() {
        // ${NUMBER:1:3} over "01234567" -> "123"
        assert_eq!(slice_str("01234567", 1, Some(3)), "123");
    }

    #[test]
    fn positive_offset_rest_of_string() {
        assert_eq!(slice_str("01234567", 5, None), "567");
    }

    #[test]
    fn negative_offset_keeps_tail() {
        assert_eq!(slice_str("01234567", -3, None), "567");
        assert_eq!(slice_str("01234567", -3, Some(2)), "56");
    }

    #[test]
    fn offset_beyond_length_clamps() {
        assert_eq!(slice_str("abc", 10, None), "");
        assert_eq!(slice_str("abc", -10, None), "abc");
    }

    #[test]
    fn over_long_length_shortens() {
        assert_eq!(slice_str("abc", 1, Some(99)), "bc");
        assert_eq!(slice_str("abc", -2, Some(99)), "bc");
    }

    #[test]
    fn non_positive_length_is_empty() {
        assert_eq!(slice_str("abc", 0, Some(0)), "");
        assert_eq!(slice_str("abc", 1, Some(-2)), "");
    }
}
