use crate::error::SyncError;
use crate::outcome::OutcomeStore;
use crate::parser::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateMatch {
    Number,
    Fingerprint,
}

pub struct DuplicateGuard<'a, S: OutcomeStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: OutcomeStore + ?Sized> DuplicateGuard<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn is_duplicate(
        &self,
        tax_identifier_id: &str,
        document_number: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> Result<bool, SyncError> {
        Ok(self
            .find_match(tax_identifier_id, document_number, fingerprint)?
            .is_some())
    }

    pub fn find_match(
        &self,
        tax_identifier_id: &str,
        document_number: Option<&str>,
        fingerprint: &Fingerprint,
    ) -> Result<Option<DuplicateMatch>, SyncError> {
        if let Some(number) = document_number
            && self
                .store
                .has_success_with_number(tax_identifier_id, number)?
        {
            return Ok(Some(DuplicateMatch::Number));
        }
        if self
            .store
            .has_success_with_fingerprint(tax_identifier_id, fingerprint.as_str())?
        {
            return Ok(Some(DuplicateMatch::Fingerprint));
        }
        Ok(None)
    }
}
