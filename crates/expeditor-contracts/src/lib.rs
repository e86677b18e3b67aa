use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const RPC_VERSION: &str = "2.0";
pub const SERVICE_NAME: &str = "expeditor";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const METHOD_LIST_TOOLS: &str = "list_tools";
pub const METHOD_EXPORT_MENU: &str = "foodtec.export_menu";
pub const METHOD_VALIDATE_ORDER: &str = "foodtec.validate_order";
pub const METHOD_ACCEPT_ORDER: &str = "foodtec.accept_order";

pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_UPSTREAM_ERROR: i64 = -32000;
pub const CODE_TRANSPORT_ERROR: i64 = -32002;

/// How the dispatcher routes a method: through the menu cache, through the
/// idempotency ledger, or straight to upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    ListTools,
    ExportMenu,
    ValidateOrder,
    AcceptOrder,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            METHOD_LIST_TOOLS => Some(Method::ListTools),
            METHOD_EXPORT_MENU => Some(Method::ExportMenu),
            METHOD_VALIDATE_ORDER => Some(Method::ValidateOrder),
            METHOD_ACCEPT_ORDER => Some(Method::AcceptOrder),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::ListTools => METHOD_LIST_TOOLS,
            Method::ExportMenu => METHOD_EXPORT_MENU,
            Method::ValidateOrder => METHOD_VALIDATE_ORDER,
            Method::AcceptOrder => METHOD_ACCEPT_ORDER,
        }
    }
}

/// One schema violation inside a request's params. `path` is dotted
/// (`customer.phone`), `value` is the offending input echoed back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldViolation {
    pub path: String,
    pub message: String,
    pub value: Value,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            value,
        }
    }
}

/// JSON-RPC error member. Cloneable so a ledgered outcome can be handed to
/// every caller that shared the same in-flight attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn invalid_request(violations: Vec<FieldViolation>) -> Self {
        Self {
            code: CODE_INVALID_REQUEST,
            message: "Invalid Request".to_string(),
            data: Some(json!({ "violations": violations })),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(violations: Vec<FieldViolation>) -> Self {
        Self {
            code: CODE_INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!({ "violations": violations })),
        }
    }

    pub fn upstream(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code: CODE_UPSTREAM_ERROR,
            message: message.into(),
            data,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: CODE_TRANSPORT_ERROR,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: CODE_INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Success envelope. The client's id is echoed verbatim, never interpreted.
pub fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": RPC_VERSION, "id": id, "result": result })
}

/// Error envelope. `id` is null when the envelope itself could not be parsed.
pub fn rpc_error(id: &Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": RPC_VERSION, "id": id, "error": error })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MenuExportParams {
    pub store_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderValidateParams {
    pub category: String,
    pub item: String,
    pub size: String,
    pub price: f64,
    pub customer: Customer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAcceptParams {
    pub category: String,
    pub item: String,
    pub size: String,
    pub customer: Customer,
    /// Pre-tax listed price.
    pub menu_price: f64,
    /// Tax-inclusive price from validation, authoritative for acceptance.
    pub canonical_price: f64,
    pub external_ref: String,
    pub idem: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Discovery catalog served by `list_tools` and `GET /tools`. The parameter
/// documents mirror what the validators enforce.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: METHOD_EXPORT_MENU,
            description: "Exports the menu for a store, cached for ten minutes",
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "store_id": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Store identifier; defaults to \"default\""
                    }
                }
            }),
        },
        ToolDefinition {
            name: METHOD_VALIDATE_ORDER,
            description: "Validates an order draft and returns the canonical price",
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["category", "item", "size", "price", "customer"],
                "properties": {
                    "category": { "type": "string", "minLength": 1 },
                    "item": { "type": "string", "minLength": 1 },
                    "size": { "type": "string", "minLength": 1 },
                    "price": { "type": "number", "minimum": 0 },
                    "customer": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["name", "phone"],
                        "properties": {
                            "name": { "type": "string", "minLength": 1 },
                            "phone": { "type": "string", "pattern": "^[0-9]{3}-[0-9]{3}-[0-9]{4}$" }
                        }
                    }
                }
            }),
        },
        ToolDefinition {
            name: METHOD_ACCEPT_ORDER,
            description: "Accepts a validated order; safe to retry with the same idempotency key",
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["category", "item", "size", "customer", "menuPrice", "canonicalPrice", "externalRef"],
                "properties": {
                    "category": { "type": "string", "minLength": 1 },
                    "item": { "type": "string", "minLength": 1 },
                    "size": { "type": "string", "minLength": 1 },
                    "customer": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["name", "phone"],
                        "properties": {
                            "name": { "type": "string", "minLength": 1 },
                            "phone": { "type": "string", "pattern": "^[0-9]{3}-[0-9]{3}-[0-9]{4}$" }
                        }
                    },
                    "menuPrice": { "type": "number", "minimum": 0 },
                    "canonicalPrice": { "type": "number", "minimum": 0 },
                    "externalRef": { "type": "string", "minLength": 3 },
                    "idem": { "type": "string", "minLength": 3 }
                }
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_parameter_documents_are_valid_json_schema() {
        for tool in tool_definitions() {
            let _validator = jsonschema::validator_for(&tool.parameters)
                .unwrap_or_else(|err| panic!("invalid schema for {}: {err}", tool.name));
        }
    }

    #[test]
    fn every_tool_is_a_recognized_method() {
        for tool in tool_definitions() {
            assert!(Method::from_name(tool.name).is_some(), "{}", tool.name);
        }
    }

    #[test]
    fn error_envelope_serializes_without_empty_data() {
        let err = RpcError::method_not_found("foodtec.cancel_order");
        let envelope = rpc_error(&Value::Null, &err);
        assert_eq!(envelope["jsonrpc"], "2.0");
        assert_eq!(envelope["id"], Value::Null);
        assert_eq!(envelope["error"]["code"], -32601);
        assert!(envelope["error"]
            .as_object()
            .is_some_and(|e| !e.contains_key("data")));
        assert!(envelope["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("foodtec.cancel_order")));
    }

    #[test]
    fn result_envelope_echoes_id_verbatim() {
        let id = json!("corr-17");
        let envelope = rpc_result(&id, json!({ "ok": true }));
        assert_eq!(envelope["id"], json!("corr-17"));
        assert_eq!(envelope["result"]["ok"], true);
    }
}
