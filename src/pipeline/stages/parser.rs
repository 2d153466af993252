use serde_json::Value;

use super::SchemaError;

/// Pull the JSON object out of a model response.
///
/// Accepts a fenced ```json block (or a bare ``` fence holding an object),
/// otherwise the outermost `{ … }` span of the whole response. Anything that
/// does not parse to a JSON object is a [`SchemaError`].
pub fn extract_json(response: &str) -> Result<Value, SchemaError> {
    let candidate = fenced_block(response)
        .or_else(|| outermost_object(response))
        .ok_or(SchemaError::NoJsonObject)?;

    let value: Value =
        serde_json::from_str(candidate).map_err(|e| SchemaError::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(SchemaError::NoJsonObject);
    }
    Ok(value)
}

fn fenced_block(response: &str) -> Option<&str> {
    let lower = response.to_ascii_lowercase();
    let (content_start, fence_len) = match lower.find("```json") {
        Some(pos) => (pos, 7),
        None => (lower.find("```")?, 3),
    };
    let body_start = content_start + fence_len;
    let body_len = response[body_start..].find("```")?;
    let body = response[body_start..body_start + body_len].trim();
    body.starts_with('{').then_some(body)
}

fn outermost_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_object() {
        let v = extract_json(r#"{"is_fault": true}"#).unwrap();
        assert_eq!(v["is_fault"], true);
    }

    #[test]
    fn parses_fenced_block_with_prose() {
        let response = "Here is the verdict:\n```json\n{\"confidence\": 92}\n```\nDone.";
        assert_eq!(extract_json(response).unwrap()["confidence"], 92);
    }

    #[test]
    fn parses_uppercase_and_bare_fences() {
        assert!(extract_json("```JSON\n{\"a\":1}\n```").is_ok());
        assert!(extract_json("```\n{\"a\":1}\n```").is_ok());
    }

    #[test]
    fn falls_back_to_outermost_braces() {
        let response = "Result: {\"rules\": [{\"rule_id\": \"R001\"}]} -- end";
        let v = extract_json(response).unwrap();
        assert_eq!(v["rules"][0]["rule_id"], "R001");
    }

    #[test]
    fn no_object_is_error() {
        assert_eq!(extract_json("I cannot help"), Err(SchemaError::NoJsonObject));
        assert_eq!(extract_json("[1, 2]"), Err(SchemaError::NoJsonObject));
    }

    #[test]
    fn broken_json_is_error() {
        assert!(matches!(
            extract_json("{\"is_fault\": tru"),
            Err(SchemaError::NoJsonObject) | Err(SchemaError::Json(_))
        ));
        assert!(matches!(extract_json("{\"a\": }"), Err(SchemaError::Json(_))));
    }
}
