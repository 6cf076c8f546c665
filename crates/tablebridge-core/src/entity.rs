//! Entity references.
//!
//! The remote service addresses objects by `(kind, id)`. This crate only
//! needs identity, kind and the consistency group an object lives in; the
//! rest of the remote object graph is out of scope.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Kinds of remote objects this crate can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// A single image.
    Image,
    /// A dataset of images.
    Dataset,
    /// A project grouping datasets.
    Project,
    /// A multi-well plate.
    Plate,
    /// A well within a plate.
    Well,
    /// A screen grouping plates.
    Screen,
    /// A region of interest.
    Roi,
    /// An annotation wrapping an original file.
    FileAnnotation,
    /// A raw file stored by the service.
    OriginalFile,
}

impl EntityKind {
    const ALL: [EntityKind; 9] = [
        EntityKind::Image,
        EntityKind::Dataset,
        EntityKind::Project,
        EntityKind::Plate,
        EntityKind::Well,
        EntityKind::Screen,
        EntityKind::Roi,
        EntityKind::FileAnnotation,
        EntityKind::OriginalFile,
    ];

    /// Canonical name used on the wire (`Image`, `FileAnnotation`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Image => "Image",
            EntityKind::Dataset => "Dataset",
            EntityKind::Project => "Project",
            EntityKind::Plate => "Plate",
            EntityKind::Well => "Well",
            EntityKind::Screen => "Screen",
            EntityKind::Roi => "Roi",
            EntityKind::FileAnnotation => "FileAnnotation",
            EntityKind::OriginalFile => "OriginalFile",
        }
    }

    /// Whether a table annotation can be linked to objects of this kind.
    pub fn is_linkable(self) -> bool {
        !matches!(self, EntityKind::FileAnnotation | EntityKind::OriginalFile)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while parsing entity kinds or references from text.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseEntityError {
    /// The kind name is not one of the known [`EntityKind`]s.
    #[snafu(display("Unknown object type '{name}'"))]
    UnknownKind {
        /// The unrecognized name.
        name: String,
    },

    /// The reference is not of the form `Kind:id`.
    #[snafu(display("Invalid object reference '{spec}', expected Kind:id"))]
    InvalidReference {
        /// The offending input.
        spec: String,
    },
}

impl FromStr for EntityKind {
    type Err = ParseEntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseEntityError::UnknownKind {
                name: wanted.to_string(),
            })
    }
}

/// A durable `(kind, id)` reference to a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Object kind.
    pub kind: EntityKind,
    /// Server-side identifier.
    pub id: i64,
}

impl EntityRef {
    /// Build a reference from its parts.
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }

    /// Shorthand for an image reference.
    pub fn image(id: i64) -> Self {
        Self::new(EntityKind::Image, id)
    }

    /// Shorthand for a file annotation reference.
    pub fn file_annotation(id: i64) -> Self {
        Self::new(EntityKind::FileAnnotation, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = ParseEntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').context(InvalidReferenceSnafu { spec: s })?;
        let kind = kind.parse::<EntityKind>()?;
        let id = id
            .trim()
            .parse::<i64>()
            .ok()
            .context(InvalidReferenceSnafu { spec: s })?;
        Ok(EntityRef { kind, id })
    }
}

/// Consistency group (ownership / access-control scope) of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
