//! Protocol Templates
//!
//! A protocol template fixes the set of checklist items for a protocol
//! variant and supplies their display metadata. Templates are configuration:
//! the built-in default can be replaced by a JSON file.

use crate::checklist::{ChecklistItemState, ChecklistSnapshot};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Display metadata for one checklist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tips: Vec<String>,
}

/// A checklist item joined with its display metadata, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistEntry {
    pub id: String,
    pub label: String,
    pub description: String,
    pub tips: Vec<String>,
    pub completed: bool,
    /// False for ids the template does not define.
    pub known: bool,
}

/// The fixed, ordered checklist of a protocol variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTemplate {
    pub name: String,
    pub items: Vec<ItemMetadata>,
}

impl ProtocolTemplate {
    /// Loads a template from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read protocol template {}", path.display()))?;
        let template: ProtocolTemplate = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid protocol template {}", path.display()))?;
        anyhow::ensure!(
            !template.items.is_empty(),
            "Protocol template '{}' defines no checklist items",
            template.name
        );
        Ok(template)
    }

    pub fn get(&self, id: &str) -> Option<&ItemMetadata> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Returns the metadata for `id`, falling back to the raw id as label
    /// with an empty description for ids this template does not know.
    pub fn resolve(&self, id: &str) -> ItemMetadata {
        self.get(id).cloned().unwrap_or_else(|| ItemMetadata {
            id: id.to_string(),
            label: id.to_string(),
            description: String::new(),
            tips: Vec::new(),
        })
    }

    pub fn describe(&self, item: &ChecklistItemState) -> ChecklistEntry {
        let metadata = self.resolve(&item.id);
        ChecklistEntry {
            id: item.id.clone(),
            label: metadata.label,
            description: metadata.description,
            tips: metadata.tips,
            completed: item.completed,
            known: self.contains(&item.id),
        }
    }

    /// A checklist with every template item incomplete.
    pub fn empty_checklist(&self) -> ChecklistSnapshot {
        ChecklistSnapshot::from_pairs(self.items.iter().map(|item| (item.id.clone(), false)))
    }

    /// Adds any template item missing from `checklist` as incomplete.
    /// Items the template does not define are kept untouched.
    pub fn seed(&self, checklist: &ChecklistSnapshot) -> ChecklistSnapshot {
        self.empty_checklist().merged_with(checklist)
    }

    /// Renders a checklist in template order, followed by unknown ids.
    pub fn entries(&self, checklist: &ChecklistSnapshot) -> Vec<ChecklistEntry> {
        let mut entries: Vec<ChecklistEntry> = self
            .items
            .iter()
            .map(|item| {
                let state = checklist
                    .get(&item.id)
                    .cloned()
                    .unwrap_or_else(|| ChecklistItemState::new(item.id.clone(), false));
                self.describe(&state)
            })
            .collect();
        entries.extend(
            checklist
                .items()
                .filter(|item| !self.contains(&item.id))
                .map(|item| self.describe(item)),
        );
        entries
    }

    /// Share of template items completed, from 0 to 100.
    pub fn completion_percentage(&self, checklist: &ChecklistSnapshot) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        let done = self
            .items
            .iter()
            .filter(|item| checklist.is_completed(&item.id))
            .count();
        done as f64 / self.items.len() as f64 * 100.0
    }
}

impl Default for ProtocolTemplate {
    /// The first-session protocol: rapport, reflective question, validation
    /// and therapeutic goal.
    fn default() -> Self {
        let item = |id: &str, label: &str, description: &str| ItemMetadata {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            tips: Vec::new(),
        };
        Self {
            name: "sesion-inicial".to_string(),
            items: vec![
                item(
                    "rapport",
                    "Rapport (Bienvenida)",
                    "Establecimiento de la conexión inicial con el paciente",
                ),
                item(
                    "pregunta_refleja",
                    "Pregunta Refleja",
                    "Técnica que devuelve al paciente sus propias palabras",
                ),
                item(
                    "validacion",
                    "Validación",
                    "Reconocimiento de las emociones del paciente",
                ),
                item(
                    "objetivo_terapeutico",
                    "Objetivo Terapéutico",
                    "Identificación de metas específicas",
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_template_items() {
        let template = ProtocolTemplate::default();
        let ids: Vec<&str> = template.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["rapport", "pregunta_refleja", "validacion", "objetivo_terapeutico"]
        );
    }

    #[test]
    fn test_resolve_unknown_id_falls_back_to_raw_id() {
        let template = ProtocolTemplate::default();
        let metadata = template.resolve("cierre_sesion");

        assert_eq!(metadata.label, "cierre_sesion");
        assert!(metadata.description.is_empty());
        assert!(metadata.tips.is_empty());
    }

    #[test]
    fn test_seed_fills_missing_items_and_keeps_unknown_ones() {
        let template = ProtocolTemplate::default();
        let reported = ChecklistSnapshot::from_pairs([("rapport", true), ("extra", true)]);

        let seeded = template.seed(&reported);
        assert_eq!(seeded.len(), 5);
        assert!(seeded.is_completed("rapport"));
        assert!(seeded.is_completed("extra"));
        assert!(!seeded.is_completed("validacion"));
    }

    #[test]
    fn test_entries_follow_template_order_then_unknown() {
        let template = ProtocolTemplate::default();
        let checklist = ChecklistSnapshot::from_pairs([("zeta", false), ("validacion", true)]);

        let entries = template.entries(&checklist);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "rapport",
                "pregunta_refleja",
                "validacion",
                "objetivo_terapeutico",
                "zeta"
            ]
        );
        assert!(entries[2].completed);
        assert_eq!(entries[2].label, "Validación");
        assert!(!entries[4].known);
        assert_eq!(entries[4].label, "zeta");
    }

    #[test]
    fn test_completion_percentage() {
        let template = ProtocolTemplate::default();
        let checklist = ChecklistSnapshot::from_pairs([("rapport", true), ("extra", true)]);
        assert_eq!(template.completion_percentage(&checklist), 25.0);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "seguimiento", "items": [
                {{"id": "resumen", "label": "Resumen inicial", "tips": ["Retoma la sesión anterior"]}}
            ]}}"#
        )
        .unwrap();

        let template = ProtocolTemplate::from_file(file.path()).unwrap();
        assert_eq!(template.name, "seguimiento");
        assert_eq!(template.items[0].tips, vec!["Retoma la sesión anterior"]);
        assert!(template.items[0].description.is_empty());
    }

    #[test]
    fn test_from_file_rejects_empty_template() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "vacio", "items": []}}"#).unwrap();

        let err = ProtocolTemplate::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("defines no checklist items"));
    }

    #[test]
    fn test_shipped_follow_up_template_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../protocols/seguimiento.json");
        let template = ProtocolTemplate::from_file(&path).unwrap();

        assert_eq!(template.items.len(), 5);
        assert!(template.contains("session-closure"));
        let seeded = template.seed(&ChecklistSnapshot::new());
        assert_eq!(seeded.len(), 5);
        assert_eq!(seeded.completed_count(), 0);
    }
}
