use expeditor_contracts::{
    Customer, FieldViolation, MenuExportParams, OrderAcceptParams, OrderValidateParams,
    RPC_VERSION,
};
use serde_json::{json, Map, Value};

pub const DEFAULT_STORE_ID: &str = "default";
pub const MIN_REF_LEN: usize = 3;

/// A structurally valid JSON-RPC request. The method is still unresolved at
/// this point; allow-listing is the dispatcher's job.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    pub params: Map<String, Value>,
}

/// Checks the envelope shape: protocol tag, id, method, params. Pure; the
/// violations it returns map to an Invalid Request error with a null id.
pub fn parse_envelope(body: &Value) -> Result<RpcRequest, Vec<FieldViolation>> {
    let mut violations = Vec::new();

    let Some(obj) = body.as_object() else {
        return Err(vec![FieldViolation::new(
            "",
            "request must be a JSON object",
            body.clone(),
        )]);
    };

    match obj.get("jsonrpc") {
        Some(v) if v.as_str() == Some(RPC_VERSION) => {}
        Some(v) => violations.push(FieldViolation::new(
            "jsonrpc",
            format!("jsonrpc must be the literal \"{RPC_VERSION}\""),
            v.clone(),
        )),
        None => violations.push(FieldViolation::new("jsonrpc", "jsonrpc is required", Value::Null)),
    }

    let id = match obj.get("id") {
        Some(v) if v.is_string() || v.is_number() => v.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                "id",
                "id must be a string or a number",
                v.clone(),
            ));
            Value::Null
        }
        None => {
            violations.push(FieldViolation::new("id", "id is required", Value::Null));
            Value::Null
        }
    };

    let method = match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => m.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                "method",
                "method must be a non-empty string",
                v.clone(),
            ));
            String::new()
        }
        None => {
            violations.push(FieldViolation::new(
                "method",
                "method is required",
                Value::Null,
            ));
            String::new()
        }
    };

    let params = match obj.get("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(p)) => p.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                "params",
                "params must be an object",
                v.clone(),
            ));
            Map::new()
        }
    };

    for key in obj.keys() {
        if !matches!(key.as_str(), "jsonrpc" | "id" | "method" | "params") {
            violations.push(FieldViolation::new(
                key.clone(),
                "unrecognized field",
                obj[key].clone(),
            ));
        }
    }

    if violations.is_empty() {
        Ok(RpcRequest { id, method, params })
    } else {
        Err(violations)
    }
}

pub fn validate_menu_export(
    params: &Map<String, Value>,
) -> Result<MenuExportParams, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    reject_unknown_fields(params, &["store_id"], "", &mut violations);

    let store_id = match params.get("store_id") {
        None => DEFAULT_STORE_ID.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                "store_id",
                "store_id must be a non-empty string",
                v.clone(),
            ));
            String::new()
        }
    };

    if violations.is_empty() {
        Ok(MenuExportParams { store_id })
    } else {
        Err(violations)
    }
}

pub fn validate_order_validate(
    params: &Map<String, Value>,
) -> Result<OrderValidateParams, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    reject_unknown_fields(
        params,
        &["category", "item", "size", "price", "customer"],
        "",
        &mut violations,
    );

    let category = required_string(params, "category", &mut violations);
    let item = required_string(params, "item", &mut violations);
    let size = required_string(params, "size", &mut violations);
    let price = required_price(params, "price", &mut violations);
    let customer = required_customer(params, &mut violations);

    if violations.is_empty() {
        Ok(OrderValidateParams {
            category,
            item,
            size,
            price,
            customer,
        })
    } else {
        Err(violations)
    }
}

pub fn validate_order_accept(
    params: &Map<String, Value>,
) -> Result<OrderAcceptParams, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    reject_unknown_fields(
        params,
        &[
            "category",
            "item",
            "size",
            "customer",
            "menuPrice",
            "canonicalPrice",
            "externalRef",
            "idem",
        ],
        "",
        &mut violations,
    );

    let category = required_string(params, "category", &mut violations);
    let item = required_string(params, "item", &mut violations);
    let size = required_string(params, "size", &mut violations);
    let customer = required_customer(params, &mut violations);

    let before_prices = violations.len();
    let menu_price = required_price(params, "menuPrice", &mut violations);
    let canonical_price = required_price(params, "canonicalPrice", &mut violations);

    // The tax-inclusive price can never undercut the listed one; a canonical
    // price below menu price means validation and acceptance disagree.
    if violations.len() == before_prices && canonical_price < menu_price {
        violations.push(FieldViolation::new(
            "canonicalPrice",
            "canonicalPrice must be greater than or equal to menuPrice",
            json!({ "menuPrice": menu_price, "canonicalPrice": canonical_price }),
        ));
    }

    let external_ref = required_min_len(params, "externalRef", MIN_REF_LEN, &mut violations);
    let idem = match params.get("idem") {
        None => None,
        Some(Value::String(s)) if s.len() >= MIN_REF_LEN => Some(s.clone()),
        Some(v) => {
            violations.push(FieldViolation::new(
                "idem",
                format!("idem must be a string of at least {MIN_REF_LEN} characters"),
                v.clone(),
            ));
            None
        }
    };

    if violations.is_empty() {
        Ok(OrderAcceptParams {
            category,
            item,
            size,
            customer,
            menu_price,
            canonical_price,
            external_ref,
            idem,
        })
    } else {
        Err(violations)
    }
}

fn reject_unknown_fields(
    params: &Map<String, Value>,
    allowed: &[&str],
    prefix: &str,
    violations: &mut Vec<FieldViolation>,
) {
    for key in params.keys() {
        if !allowed.contains(&key.as_str()) {
            violations.push(FieldViolation::new(
                format!("{prefix}{key}"),
                "unrecognized field",
                params[key].clone(),
            ));
        }
    }
}

fn required_string(
    params: &Map<String, Value>,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> String {
    match params.get(field) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                field,
                format!("{field} must be a non-empty string"),
                v.clone(),
            ));
            String::new()
        }
        None => {
            violations.push(FieldViolation::new(
                field,
                format!("{field} is required"),
                Value::Null,
            ));
            String::new()
        }
    }
}

fn required_min_len(
    params: &Map<String, Value>,
    field: &str,
    min: usize,
    violations: &mut Vec<FieldViolation>,
) -> String {
    match params.get(field) {
        Some(Value::String(s)) if s.len() >= min => s.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                field,
                format!("{field} must be a string of at least {min} characters"),
                v.clone(),
            ));
            String::new()
        }
        None => {
            violations.push(FieldViolation::new(
                field,
                format!("{field} is required"),
                Value::Null,
            ));
            String::new()
        }
    }
}

fn required_price(
    params: &Map<String, Value>,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> f64 {
    match params.get(field) {
        Some(v) if v.is_number() => {
            let n = v.as_f64().unwrap_or(f64::NAN);
            if n.is_finite() && n >= 0.0 {
                n
            } else {
                violations.push(FieldViolation::new(
                    field,
                    "Prices must be non-negative and finite",
                    v.clone(),
                ));
                0.0
            }
        }
        Some(v) => {
            violations.push(FieldViolation::new(
                field,
                format!("{field} must be a number"),
                v.clone(),
            ));
            0.0
        }
        None => {
            violations.push(FieldViolation::new(
                field,
                format!("{field} is required"),
                Value::Null,
            ));
            0.0
        }
    }
}

fn required_customer(
    params: &Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Customer {
    let empty = Customer {
        name: String::new(),
        phone: String::new(),
    };
    let obj = match params.get("customer") {
        Some(Value::Object(o)) => o,
        Some(v) => {
            violations.push(FieldViolation::new(
                "customer",
                "customer must be an object",
                v.clone(),
            ));
            return empty;
        }
        None => {
            violations.push(FieldViolation::new(
                "customer",
                "customer is required",
                Value::Null,
            ));
            return empty;
        }
    };

    reject_unknown_fields(obj, &["name", "phone"], "customer.", violations);

    let name = match obj.get("name") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                "customer.name",
                "customer.name must be a non-empty string",
                v.clone(),
            ));
            String::new()
        }
        None => {
            violations.push(FieldViolation::new(
                "customer.name",
                "customer.name is required",
                Value::Null,
            ));
            String::new()
        }
    };

    let phone = match obj.get("phone") {
        Some(Value::String(s)) if phone_shape_ok(s) => s.clone(),
        Some(v) => {
            violations.push(FieldViolation::new(
                "customer.phone",
                "customer.phone must match NNN-NNN-NNNN",
                v.clone(),
            ));
            String::new()
        }
        None => {
            violations.push(FieldViolation::new(
                "customer.phone",
                "customer.phone is required",
                Value::Null,
            ));
            String::new()
        }
    };

    Customer { name, phone }
}

/// Exact NNN-NNN-NNNN shape, digits and dashes only.
pub fn phone_shape_ok(phone: &str) -> bool {
    let bytes = phone.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        3 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_params(patch: Value) -> Map<String, Value> {
        let mut base = json!({
            "category": "Appetizer",
            "item": "3pcs Chicken Strips w/ FF",
            "size": "Lg",
            "customer": { "name": "Test User", "phone": "410-555-1234" },
            "menuPrice": 6.99,
            "canonicalPrice": 7.41,
            "externalRef": "ext-1",
            "idem": "idem-1"
        });
        for (k, v) in patch.as_object().cloned().unwrap_or_default() {
            base[k] = v;
        }
        base.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn envelope_roundtrip_keeps_id_and_method() {
        let body = json!({ "jsonrpc": "2.0", "id": 42, "method": "list_tools" });
        let req = parse_envelope(&body).expect("valid envelope");
        assert_eq!(req.id, json!(42));
        assert_eq!(req.method, "list_tools");
        assert!(req.params.is_empty());
    }

    #[test]
    fn envelope_rejects_wrong_protocol_tag() {
        let body = json!({ "jsonrpc": "1.0", "id": 1, "method": "m" });
        let violations = parse_envelope(&body).expect_err("bad tag");
        assert!(violations.iter().any(|v| v.path == "jsonrpc"));
    }

    #[test]
    fn envelope_rejects_missing_id_and_method() {
        let violations = parse_envelope(&json!({ "jsonrpc": "2.0" })).expect_err("incomplete");
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"id"));
        assert!(paths.contains(&"method"));
    }

    #[test]
    fn envelope_rejects_non_object_body() {
        assert!(parse_envelope(&json!([1, 2, 3])).is_err());
        assert!(parse_envelope(&json!("hello")).is_err());
    }

    #[test]
    fn envelope_rejects_extra_top_level_fields() {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "m", "extra": true });
        let violations = parse_envelope(&body).expect_err("extra field");
        assert!(violations.iter().any(|v| v.path == "extra"));
    }

    #[test]
    fn accept_happy_path_produces_typed_params() {
        let params = validate_order_accept(&accept_params(json!({}))).expect("valid params");
        assert_eq!(params.customer.phone, "410-555-1234");
        assert_eq!(params.idem.as_deref(), Some("idem-1"));
        assert!((params.canonical_price - 7.41).abs() < f64::EPSILON);
    }

    #[test]
    fn accept_idem_is_optional() {
        let mut map = accept_params(json!({}));
        map.remove("idem");
        let params = validate_order_accept(&map).expect("valid without idem");
        assert_eq!(params.idem, None);
    }

    #[test]
    fn accept_rejects_canonical_below_menu_price_naming_both_fields() {
        let err = validate_order_accept(&accept_params(json!({ "canonicalPrice": 6.50 })))
            .expect_err("price invariant");
        let hit = err
            .iter()
            .find(|v| v.path == "canonicalPrice")
            .expect("canonicalPrice violation");
        assert!(hit.message.contains("canonicalPrice"));
        assert!(hit.message.contains("menuPrice"));
        assert_eq!(hit.value["menuPrice"], json!(6.99));
    }

    #[test]
    fn accept_rejects_negative_prices() {
        let err = validate_order_accept(&accept_params(json!({ "menuPrice": -6.99 })))
            .expect_err("negative price");
        assert!(err
            .iter()
            .any(|v| v.path == "menuPrice" && v.message.starts_with("Prices must be")));
    }

    #[test]
    fn negative_price_does_not_also_trip_the_ordering_invariant() {
        let err = validate_order_accept(&accept_params(json!({ "menuPrice": -6.99 })))
            .expect_err("negative price");
        assert_eq!(err.len(), 1);
    }

    #[test]
    fn accept_rejects_undashed_phone_and_mentions_the_field() {
        let err = validate_order_accept(&accept_params(
            json!({ "customer": { "name": "Test User", "phone": "1234567890" } }),
        ))
        .expect_err("bad phone");
        let hit = err
            .iter()
            .find(|v| v.path == "customer.phone")
            .expect("phone violation");
        assert!(hit.message.contains("phone"));
    }

    #[test]
    fn accept_rejects_short_external_ref() {
        let err = validate_order_accept(&accept_params(json!({ "externalRef": "ab" })))
            .expect_err("short ref");
        assert!(err.iter().any(|v| v.path == "externalRef"));
    }

    #[test]
    fn accept_rejects_unknown_fields() {
        let err = validate_order_accept(&accept_params(json!({ "tip": 2.00 })))
            .expect_err("unknown field");
        assert!(err
            .iter()
            .any(|v| v.path == "tip" && v.message == "unrecognized field"));
    }

    #[test]
    fn accept_rejects_unknown_customer_fields() {
        let err = validate_order_accept(&accept_params(json!({
            "customer": { "name": "Test User", "phone": "410-555-1234", "email": "a@b.c" }
        })))
        .expect_err("unknown customer field");
        assert!(err.iter().any(|v| v.path == "customer.email"));
    }

    #[test]
    fn menu_export_defaults_store_id() {
        let params = validate_menu_export(&Map::new()).expect("empty params ok");
        assert_eq!(params.store_id, DEFAULT_STORE_ID);
    }

    #[test]
    fn menu_export_rejects_empty_store_id() {
        let map = json!({ "store_id": "" }).as_object().cloned().unwrap_or_default();
        assert!(validate_menu_export(&map).is_err());
    }

    #[test]
    fn validate_order_reports_one_violation_per_field() {
        let map = json!({ "category": "", "item": 7 })
            .as_object()
            .cloned()
            .unwrap_or_default();
        let err = validate_order_validate(&map).expect_err("many violations");
        let paths: Vec<_> = err.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"category"));
        assert!(paths.contains(&"item"));
        assert!(paths.contains(&"size"));
        assert!(paths.contains(&"price"));
        assert!(paths.contains(&"customer"));
    }

    #[test]
    fn phone_shape_examples() {
        assert!(phone_shape_ok("410-555-1234"));
        assert!(!phone_shape_ok("4105551234"));
        assert!(!phone_shape_ok("410-555-123"));
        assert!(!phone_shape_ok("410-55x-1234"));
        assert!(!phone_shape_ok("410+555+1234"));
    }
}
