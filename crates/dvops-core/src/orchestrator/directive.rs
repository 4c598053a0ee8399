use dataverse_client::{EntityDescriptor, MergeOptions, MergeRequest, RecordId, RecordSummary};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectiveError {
    #[error("entity '{0}' does not support merge")]
    NotMergeable(String),

    #[error("no duplicate to merge")]
    NoDuplicates,

    #[error("master and duplicate are the same record ({0})")]
    SelfMerge(RecordId),

    #[error("{role} {id} is a '{found}' record, expected '{expected}'")]
    EntityMismatch {
        role: &'static str,
        id: RecordId,
        found: String,
        expected: String,
    },

    #[error("master {0} was itself merged into another record")]
    MasterMerged(RecordId),
}

/// A validated intent to fold `duplicate_ids` into `master_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeDirective {
    pub entity: EntityDescriptor,
    pub master_id: RecordId,
    pub duplicate_ids: Vec<RecordId>,
    pub options: MergeOptions,
}

impl MergeDirective {
    pub fn new(
        entity: EntityDescriptor,
        master_id: RecordId,
        duplicate_ids: Vec<RecordId>,
        options: MergeOptions,
    ) -> Self {
        Self {
            entity,
            master_id,
            duplicate_ids,
            options,
        }
    }

    /// Check the directive against the resolved records before anything is
    /// sent.
    pub fn validate(
        &self,
        master: &RecordSummary,
        duplicates: &[RecordSummary],
    ) -> Result<(), DirectiveError> {
        if !self.entity.mergeable {
            return Err(DirectiveError::NotMergeable(self.entity.name.clone()));
        }
        if self.duplicate_ids.is_empty() {
            return Err(DirectiveError::NoDuplicates);
        }

        let expected = &self.entity.logical_name;
        if &master.entity != expected {
            return Err(DirectiveError::EntityMismatch {
                role: "master",
                id: master.id,
                found: master.entity.clone(),
                expected: expected.clone(),
            });
        }
        if master.is_merged() {
            return Err(DirectiveError::MasterMerged(master.id));
        }

        for id in &self.duplicate_ids {
            if *id == self.master_id {
                return Err(DirectiveError::SelfMerge(*id));
            }
        }
        for dup in duplicates {
            if &dup.entity != expected {
                return Err(DirectiveError::EntityMismatch {
                    role: "duplicate",
                    id: dup.id,
                    found: dup.entity.clone(),
                    expected: expected.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn request(&self, duplicate: RecordId) -> MergeRequest<'_> {
        MergeRequest {
            entity: &self.entity,
            master: self.master_id,
            duplicate,
            options: &self.options,
        }
    }
}
