//! Mandatory document checks.
//!
//! Document storage lives elsewhere; the workflow only tracks which document
//! types were attached and asks a checker which mandatory ones are missing.

use crate::types::{BenefitType, DocumentType};
use std::collections::{BTreeSet, HashMap};

/// Reports mandatory documents missing for a benefit type.
pub trait DocumentRequirementChecker: Send + Sync {
    /// Mandatory document types of `benefit_type` absent from `attached`.
    ///
    /// An empty result means the request may be submitted.
    fn missing_documents(
        &self,
        benefit_type: &BenefitType,
        attached: &BTreeSet<DocumentType>,
    ) -> Vec<DocumentType>;
}

/// Fixed table of mandatory documents per benefit type.
///
/// Benefit types without an entry require nothing.
#[derive(Debug, Clone, Default)]
pub struct StaticDocumentRequirements {
    required: HashMap<BenefitType, Vec<DocumentType>>,
}

impl StaticDocumentRequirements {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the mandatory documents of a benefit type, in reporting order.
    #[must_use]
    pub fn require<I, D>(mut self, benefit_type: impl Into<BenefitType>, documents: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DocumentType>,
    {
        self.required.insert(
            benefit_type.into(),
            documents.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl DocumentRequirementChecker for StaticDocumentRequirements {
    fn missing_documents(
        &self,
        benefit_type: &BenefitType,
        attached: &BTreeSet<DocumentType>,
    ) -> Vec<DocumentType> {
        self.required
            .get(benefit_type)
            .map(|required| {
                required
                    .iter()
                    .filter(|document| !attached.contains(*document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> StaticDocumentRequirements {
        StaticDocumentRequirements::new().require(
            "birth_allowance",
            ["birth_certificate", "responsibility_term"],
        )
    }

    #[test]
    fn reports_missing_in_declared_order() {
        let missing = checker().missing_documents(&BenefitType::new("birth_allowance"), &BTreeSet::new());
        assert_eq!(
            missing,
            vec![
                DocumentType::new("birth_certificate"),
                DocumentType::new("responsibility_term")
            ]
        );
    }

    #[test]
    fn attached_documents_are_not_reported() {
        let attached: BTreeSet<_> = [DocumentType::new("birth_certificate")].into_iter().collect();
        let missing = checker().missing_documents(&BenefitType::new("birth_allowance"), &attached);
        assert_eq!(missing, vec![DocumentType::new("responsibility_term")]);
    }

    #[test]
    fn unknown_benefit_type_requires_nothing() {
        let missing = checker().missing_documents(&BenefitType::new("funeral_aid"), &BTreeSet::new());
        assert!(missing.is_empty());
    }
}
