mod decoder;
mod value;

pub use decoder::{decode, raw_dict_value};
pub use value::BencodeValue;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), BencodeValue::Integer(-7));
    }

    #[test]
    fn test_decode_string() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::String(b"spam".to_vec())
        );
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d4:listli1ei2ee3:str3:abce").unwrap();
        assert_eq!(
            value.dict_get(b"list").and_then(|v| v.as_list()).map(|l| l.len()),
            Some(2)
        );
        assert_eq!(value.dict_get_str(b"str"), Some("abc"));
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:foo").is_err());
        assert!(decode(b"x").is_err());
    }

    #[test]
    fn test_decode_rejects_leading_zero_integer() {
        assert!(decode(b"i042e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn test_raw_dict_value_returns_exact_span() {
        let data = b"d8:announce3:url4:infod6:lengthi5e4:name1:xe3:zzzi1ee";
        let raw = raw_dict_value(data, b"info").unwrap();
        assert_eq!(raw, b"d6:lengthi5e4:name1:xe");
    }

    #[test]
    fn test_raw_dict_value_ignores_nested_keys() {
        // the "info" inside the list must not be matched
        let data = b"d1:al4:infoe4:infoi9ee";
        assert_eq!(raw_dict_value(data, b"info").unwrap(), b"i9e");
        assert!(raw_dict_value(b"d1:ai1ee", b"info").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let deep = vec![b'l'; 200_000];
        assert!(decode(&deep).is_err());

        let mut info = b"d4:info".to_vec();
        info.extend_from_slice(&deep);
        assert!(raw_dict_value(&info, b"info").is_err());
    }

    #[test]
    fn test_nesting_within_limit_decodes() {
        let mut data = vec![b'l'; 64];
        data.extend(vec![b'e'; 64]);
        assert!(decode(&data).is_ok());

        let mut data = vec![b'l'; 65];
        data.extend(vec![b'e'; 65]);
        assert!(decode(&data).is_err());
    }
}
