//! Wire-level plumbing around the external plan format
//!
//! Plans arrive either as binary protobuf or as their JSON encoding.
//! A few payloads ride in `google.protobuf.Any` side channels: the join
//! optimization hint and the table-scan detail are `StringValue`-wrapped
//! strings, and the generate relation arrives as an extension relation
//! whose detail is the [`GenerateDetail`] message below (the public
//! relational algebra has no generate variant).

use crate::TranslateError;
use prost::Message;
use substrait::proto::{Expression, Plan};

/// `google.protobuf.StringValue`, decoded structurally.
#[derive(Clone, PartialEq, Message)]
pub struct StringPayload {
    #[prost(string, tag = "1")]
    pub value: String,
}

/// Detail message of a generate extension relation: the generator
/// expression plus the child columns passed through alongside it.
#[derive(Clone, PartialEq, Message)]
pub struct GenerateDetail {
    #[prost(message, optional, tag = "1")]
    pub generator: Option<Expression>,
    #[prost(message, repeated, tag = "2")]
    pub child_output: Vec<Expression>,
}

/// Type URL under which [`GenerateDetail`] travels.
pub const GENERATE_DETAIL_TYPE_URL: &str = "/lithic.GenerateDetail";

/// Decodes a binary-serialized plan.
pub fn decode_plan(bytes: &[u8]) -> Result<Plan, TranslateError> {
    Ok(Plan::decode(bytes)?)
}

/// Decodes the JSON encoding of a plan.
pub fn decode_plan_json(json: &str) -> Result<Plan, TranslateError> {
    Ok(serde_json::from_str(json)?)
}

/// Unwraps a `StringValue` payload carried in an `Any` value.
pub fn decode_string_payload(bytes: &[u8]) -> Result<String, TranslateError> {
    let payload = StringPayload::decode(bytes)
        .map_err(|e| TranslateError::MalformedPlan(format!("bad string payload: {e}")))?;
    Ok(payload.value)
}

/// Decodes a [`GenerateDetail`] carried in an `Any` value.
pub fn decode_generate_detail(bytes: &[u8]) -> Result<GenerateDetail, TranslateError> {
    GenerateDetail::decode(bytes)
        .map_err(|e| TranslateError::MalformedPlan(format!("bad generate detail: {e}")))
}
