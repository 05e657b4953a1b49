use serde::{Deserialize, Serialize};

/// Top-level document emitted by the OCR script on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub data: OcrData,
}

/// Extracted card contents. Fields beyond `patient_info` (phenotype grids,
/// confidence scores, debug info) vary by card layout and are carried
/// through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrData {
    pub patient_info: PatientInfo,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientInfo {
    #[serde(default)]
    pub mrn: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
