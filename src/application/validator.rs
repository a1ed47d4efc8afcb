use crate::config::ProcessorConfig;
use crate::domain::bundle::{Bundle, BundleType, Entry, EntryRequest, Identifier, Method};
use crate::error::{BundleError, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;

/// `scheme:rest`, no whitespace anywhere.
static URI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:\S+$").expect("valid URI pattern"));

/// Checks the shape of a submitted Bundle and builds its typed form.
///
/// Validation is structural only: resource payloads are opaque here apart from
/// being JSON objects. The first problem found is returned, naming the field.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeValidator {
    required_identifier_system: Option<String>,
}

impl EnvelopeValidator {
    pub fn new(required_identifier_system: Option<String>) -> Self {
        Self {
            required_identifier_system,
        }
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(config.required_identifier_system.clone())
    }

    pub fn validate(&self, raw: &Value) -> Result<Bundle> {
        let body = match raw.as_object() {
            Some(body) if !body.is_empty() => body,
            _ => return Err(BundleError::validation("bundle", "Bundle missing body")),
        };

        match body.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {}
            other => {
                return Err(BundleError::validation(
                    "resourceType",
                    format!("Body must be a FHIR Bundle, not {}", describe(other)),
                ));
            }
        }

        let bundle_type = body.get("type").and_then(Value::as_str);
        if bundle_type.and_then(BundleType::parse) != Some(BundleType::Transaction) {
            return Err(BundleError::validation(
                "type",
                format!(
                    "Bundle must be of type `transaction`, not {}",
                    describe(bundle_type)
                ),
            ));
        }

        let identifier = self.validate_identifier(body.get("identifier"))?;

        let raw_entries = match body.get("entry").and_then(Value::as_array) {
            Some(entries) if !entries.is_empty() => entries,
            _ => return Err(BundleError::validation("entry", "Bundle missing entry")),
        };

        let mut seen_urls = HashSet::new();
        let mut entries = Vec::with_capacity(raw_entries.len());
        for (index, raw_entry) in raw_entries.iter().enumerate() {
            let entry = validate_entry(index, raw_entry)?;
            if let Some(url) = &entry.full_url
                && !seen_urls.insert(url.clone())
            {
                return Err(BundleError::validation(
                    format!("entry[{}].fullUrl", index),
                    format!("duplicate fullUrl {}", url),
                ));
            }
            entries.push(entry);
        }

        Ok(Bundle {
            identifier,
            entries,
        })
    }

    fn validate_identifier(&self, raw: Option<&Value>) -> Result<Option<Identifier>> {
        let identifier = match raw {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<Identifier>(value.clone())
                    .map_err(|e| BundleError::validation("identifier", e.to_string()))?,
            ),
        };

        let Some(system) = &self.required_identifier_system else {
            return Ok(identifier);
        };

        let Some(found) = &identifier else {
            return Err(BundleError::validation("identifier", "Bundle missing identifier"));
        };
        if found.system.as_deref() != Some(system.as_str()) {
            return Err(BundleError::validation(
                "identifier.system",
                format!("Bundle missing identifier {}", system),
            ));
        }
        let well_formed = found
            .value
            .as_deref()
            .and_then(|value| value.split_once('-'))
            .is_some_and(|(program, project)| {
                !program.is_empty() && !project.is_empty() && !project.contains('-')
            });
        if !well_formed {
            return Err(BundleError::validation(
                "identifier.value",
                "Bundle identifier project id not in the form 'str-str'",
            ));
        }

        Ok(identifier)
    }
}

fn validate_entry(index: usize, raw: &Value) -> Result<Entry> {
    let field = |name: &str| format!("entry[{}].{}", index, name);

    let Some(body) = raw.as_object() else {
        return Err(BundleError::validation(
            format!("entry[{}]", index),
            "entry must be an object",
        ));
    };

    let full_url = validate_full_url(body, &field("fullUrl"))?;

    let Some(request) = body.get("request").and_then(Value::as_object) else {
        return Err(BundleError::validation(field("request"), "entry missing request"));
    };
    let verb = request.get("method").and_then(Value::as_str);
    let Some(method) = verb.and_then(Method::from_verb) else {
        return Err(BundleError::validation(
            field("request.method"),
            format!(
                "Invalid entry.method {} for entry {}, must be POST, PUT or DELETE",
                describe(verb),
                describe(full_url.as_deref())
            ),
        ));
    };
    let url = match request.get("url").and_then(Value::as_str).map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => {
            return Err(BundleError::validation(
                field("request.url"),
                "entry request missing url",
            ));
        }
    };

    let resource = match body.get("resource") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(value @ Value::Object(_)) => Some(value.clone()),
        Some(_) => {
            return Err(BundleError::validation(
                field("resource"),
                "resource must be a JSON object",
            ));
        }
    };
    if method.requires_resource() && resource.is_none() {
        return Err(BundleError::validation(
            field("resource"),
            format!("{} entry requires a resource", method),
        ));
    }

    Ok(Entry {
        index,
        full_url,
        resource,
        request: EntryRequest { method, url },
    })
}

fn validate_full_url(body: &Map<String, Value>, field: &str) -> Result<Option<String>> {
    match body.get("fullUrl") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(url)) if url.is_empty() => Ok(None),
        Some(Value::String(url)) if URI_PATTERN.is_match(url) => Ok(Some(url.clone())),
        Some(Value::String(url)) => Err(BundleError::validation(
            field,
            format!("fullUrl {:?} is not a valid URI", url),
        )),
        Some(_) => Err(BundleError::validation(field, "fullUrl must be a string")),
    }
}

fn describe(value: Option<&str>) -> &str {
    value.unwrap_or("None")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle_with(entries: Value) -> Value {
        json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "identifier": {"system": "https://aced-idp.org/project_id", "value": "ohsu-test"},
            "entry": entries,
        })
    }

    fn patient_entry(full_url: &str) -> Value {
        json!({
            "fullUrl": full_url,
            "resource": {"resourceType": "Patient", "id": "b7793c1a-690e-5b7b-8b5b-867555936d06"},
            "request": {"method": "PUT", "url": "Patient/b7793c1a-690e-5b7b-8b5b-867555936d06"}
        })
    }

    fn field_of(err: BundleError) -> String {
        match err {
            BundleError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_bundle() {
        let raw = bundle_with(json!([
            patient_entry("urn:uuid:1"),
            {"request": {"method": "DELETE", "url": "Patient/abc"}}
        ]));
        let bundle = EnvelopeValidator::default().validate(&raw).unwrap();
        assert_eq!(bundle.entries.len(), 2);
        assert_eq!(bundle.entries[0].full_url.as_deref(), Some("urn:uuid:1"));
        assert_eq!(bundle.entries[1].request.method, Method::Delete);
        assert_eq!(bundle.entries[1].index, 1);
        assert_eq!(
            bundle.identifier.unwrap().value.as_deref(),
            Some("ohsu-test")
        );
    }

    #[test]
    fn test_empty_body() {
        let err = EnvelopeValidator::default().validate(&json!({})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid bundle at `bundle`: Bundle missing body");
    }

    #[test]
    fn test_wrong_resource_type() {
        let err = EnvelopeValidator::default()
            .validate(&json!({"resourceType": "Foo"}))
            .unwrap_err();
        assert!(err.to_string().contains("Body must be a FHIR Bundle, not Foo"));
    }

    #[test]
    fn test_missing_or_wrong_type() {
        let mut raw = bundle_with(json!([patient_entry("urn:uuid:1")]));
        raw.as_object_mut().unwrap().remove("type");
        let err = EnvelopeValidator::default().validate(&raw).unwrap_err();
        assert!(err.to_string().contains("Bundle must be of type `transaction`, not None"));

        raw["type"] = json!("transaction-response");
        assert_eq!(field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()), "type");

        raw["type"] = json!("batch");
        assert_eq!(field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()), "type");
    }

    #[test]
    fn test_missing_entry() {
        let validator = EnvelopeValidator::default();
        let mut raw = bundle_with(json!([]));
        assert_eq!(field_of(validator.validate(&raw).unwrap_err()), "entry");
        raw.as_object_mut().unwrap().remove("entry");
        assert_eq!(field_of(validator.validate(&raw).unwrap_err()), "entry");
    }

    #[test]
    fn test_invalid_method_names_entry() {
        let mut entry = patient_entry("urn:uuid:1");
        entry["request"]["method"] = json!("GET");
        let raw = bundle_with(json!([patient_entry("urn:uuid:0"), entry]));
        let err = EnvelopeValidator::default().validate(&raw).unwrap_err();
        assert!(err.to_string().contains("Invalid entry.method GET for entry urn:uuid:1"));
        assert_eq!(field_of(err), "entry[1].request.method");
    }

    #[test]
    fn test_missing_request_and_url() {
        let raw = bundle_with(json!([{"resource": {"resourceType": "Patient"}}]));
        assert_eq!(
            field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()),
            "entry[0].request"
        );

        let raw = bundle_with(json!([{"request": {"method": "DELETE", "url": "  "}}]));
        assert_eq!(
            field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()),
            "entry[0].request.url"
        );
    }

    #[test]
    fn test_put_requires_resource() {
        let raw = bundle_with(json!([{"resource": null, "request": {"method": "PUT", "url": "Claim"}}]));
        assert_eq!(
            field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()),
            "entry[0].resource"
        );

        let raw = bundle_with(json!([{"resource": {}, "request": {"method": "POST", "url": "Patient"}}]));
        assert_eq!(
            field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()),
            "entry[0].resource"
        );
    }

    #[test]
    fn test_full_url_syntax() {
        let raw = bundle_with(json!([patient_entry("urn:uuid:has space")]));
        assert_eq!(
            field_of(EnvelopeValidator::default().validate(&raw).unwrap_err()),
            "entry[0].fullUrl"
        );

        let raw = bundle_with(json!([patient_entry("not-a-uri")]));
        assert!(EnvelopeValidator::default().validate(&raw).is_err());

        let raw = bundle_with(json!([patient_entry("")]));
        let bundle = EnvelopeValidator::default().validate(&raw).unwrap();
        assert_eq!(bundle.entries[0].full_url, None);
    }

    #[test]
    fn test_duplicate_full_url() {
        let raw = bundle_with(json!([patient_entry("urn:uuid:1"), patient_entry("urn:uuid:1")]));
        let err = EnvelopeValidator::default().validate(&raw).unwrap_err();
        assert_eq!(field_of(err), "entry[1].fullUrl");
    }

    #[test]
    fn test_required_identifier_system() {
        let validator = EnvelopeValidator::new(Some("https://aced-idp.org/project_id".into()));
        let raw = bundle_with(json!([patient_entry("urn:uuid:1")]));
        assert!(validator.validate(&raw).is_ok());

        let mut other_system = raw.clone();
        other_system["identifier"] = json!({"system": "https://foo.bar", "value": "foo"});
        let err = validator.validate(&other_system).unwrap_err();
        assert!(err.to_string().contains("Bundle missing identifier https://aced-idp.org/project_id"));

        let mut bad_value = raw.clone();
        bad_value["identifier"]["value"] = json!("ohsu");
        assert_eq!(field_of(validator.validate(&bad_value).unwrap_err()), "identifier.value");

        let mut missing = raw;
        missing.as_object_mut().unwrap().remove("identifier");
        assert_eq!(field_of(validator.validate(&missing).unwrap_err()), "identifier");
    }
}
