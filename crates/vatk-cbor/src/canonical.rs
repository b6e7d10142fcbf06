use serde::Serialize;
use serde_cbor::value::Value;

/// Encode `value` so that equal data always yields equal bytes.
///
/// The value goes through `serde_cbor::Value` first, whose maps are ordered,
/// so struct fields and map entries come out sorted whatever order they were
/// produced in. The output starts with the self-describe tag.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let ordered: Value = serde_cbor::value::to_value(value)?;
    let mut out = Vec::new();
    let mut serializer = serde_cbor::ser::Serializer::new(&mut out);
    serializer.self_describe()?;
    ordered.serialize(&mut serializer)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as Json;

    #[test]
    fn field_order_does_not_matter() {
        let a: Json = serde_json::from_str(r#"{"vatID":"v1","snapPos":4,"inUse":true}"#).unwrap();
        let b: Json = serde_json::from_str(r#"{"inUse":true,"snapPos":4,"vatID":"v1"}"#).unwrap();
        let bytes = to_canonical_cbor(&a).unwrap();
        assert_eq!(bytes, to_canonical_cbor(&b).unwrap());

        let decoded: Json = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded, a);
    }
}
