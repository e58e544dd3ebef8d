//! Closed tag sets for the association graph.
//!
//! Documents carry a free-form `document_type` string owned by collaborators,
//! but the edges between them are typed by a closed `RelationshipType`, and
//! roll-ups are only defined for the three container kinds in `ActivityEntityType`.
//! Parsing is strict at the write boundary so aggregation can match exhaustively.

use serde::{Deserialize, Serialize};

/// The kind of edge between a document and the entity it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Parent,
    Program,
    Project,
    Sprint,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 4] = [
        RelationshipType::Parent,
        RelationshipType::Program,
        RelationshipType::Project,
        RelationshipType::Sprint,
    ];

    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Parent => "parent",
            RelationshipType::Program => "program",
            RelationshipType::Project => "project",
            RelationshipType::Sprint => "sprint",
        }
    }

    /// Parse from SQL or caller input. Unknown labels are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parent" => Some(RelationshipType::Parent),
            "program" => Some(RelationshipType::Program),
            "project" => Some(RelationshipType::Project),
            "sprint" => Some(RelationshipType::Sprint),
            _ => None,
        }
    }

    /// Legacy single-valued column that this relationship replaced.
    pub fn legacy_column(&self) -> &'static str {
        match self {
            RelationshipType::Parent => "parent_id",
            RelationshipType::Program => "program_id",
            RelationshipType::Project => "project_id",
            RelationshipType::Sprint => "sprint_id",
        }
    }

    /// Every relationship type is 0-or-1 per document by convention; the
    /// schema does not enforce it.
    pub fn is_single_valued(&self) -> bool {
        true
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container documents that activity can be rolled up under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEntityType {
    Program,
    Project,
    Sprint,
}

impl ActivityEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityEntityType::Program => "program",
            ActivityEntityType::Project => "project",
            ActivityEntityType::Sprint => "sprint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "program" => Some(ActivityEntityType::Program),
            "project" => Some(ActivityEntityType::Project),
            "sprint" => Some(ActivityEntityType::Sprint),
            _ => None,
        }
    }

    /// The `document_type` tag a document must carry to be addressed as this entity.
    pub fn document_type(&self) -> &'static str {
        self.as_str()
    }
}
