use serde::{Deserialize, Serialize};

/// Profile of the simulated patient assigned to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientSummary {
    #[serde(rename = "nombre", default)]
    pub name: String,
    #[serde(rename = "edad", default, deserialize_with = "age_as_text")]
    pub age: String,
    #[serde(rename = "imagen", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(
        rename = "numeroSesion",
        alias = "numero_sesion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_number: Option<u32>,
}

// The backend reports age either as a number or as text ("35 años").
fn age_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}
