//! Entity model and content-addressed identifiers.
//!
//! Extractors report [`ExtractedEntity`] values. The pipeline validates them
//! and mints [`Entity`] values with ids derived from the file's lineage and
//! the entity's own content, so unchanged code keeps its id across re-runs
//! and renames.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hasher::{digest_fields, ContentHash};

/// Type of code entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Trait,
    Interface,
    Impl,
    Constant,
    Module,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Trait => "trait",
            Self::Interface => "interface",
            Self::Impl => "impl",
            Self::Constant => "constant",
            Self::Module => "module",
        }
    }
}

/// Which representation of an entity is encoded.
///
/// `Metadata` carries the signature and location only; `Full` carries the
/// whole implementation and is produced on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkVariant {
    Metadata,
    Full,
}

impl ChunkVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Full => "full",
        }
    }
}

/// Source span, 1-based inclusive lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
}

impl Span {
    pub fn new(start_line: usize, end_line: usize) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start_line >= 1 && self.end_line >= self.start_line
    }
}

/// An entity as reported by an extractor, before validation and id minting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub name: String,
    pub span: Span,
    /// First line(s) of the declaration
    pub signature: Option<String>,
    /// Enclosing scope, e.g. `impl Foo` or `class Bar`
    pub scope: Option<String>,
    /// Source text of the entity
    pub text: String,
}

/// A validated entity owned by the pipeline until it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub file_path: String,
    pub kind: EntityKind,
    pub name: String,
    pub span: Span,
    /// Hash of the entity's source text
    pub content_hash: ContentHash,
    pub variant: ChunkVariant,
    pub signature: Option<String>,
    pub scope: Option<String>,
    /// Text sent to the embedding provider
    pub text: String,
}

/// Content-addressed id, 128 bits as 32 hex characters.
pub fn entity_id(
    lineage: &str,
    kind: EntityKind,
    name: &str,
    start_line: usize,
    variant: ChunkVariant,
    content_hash: &ContentHash,
) -> String {
    let start = start_line.to_string();
    let digest = digest_fields(&[
        lineage.as_bytes(),
        kind.as_str().as_bytes(),
        name.as_bytes(),
        start.as_bytes(),
        variant.as_str().as_bytes(),
        content_hash.as_str().as_bytes(),
    ]);
    digest[..32].to_string()
}

impl Entity {
    /// Build an entity for one variant of an extracted entity.
    pub fn mint(
        file_path: &str,
        lineage: &str,
        extracted: &ExtractedEntity,
        variant: ChunkVariant,
    ) -> Self {
        let content_hash = ContentHash::of(extracted.text.as_bytes());
        let id = entity_id(
            lineage,
            extracted.kind,
            &extracted.name,
            extracted.span.start_line,
            variant,
            &content_hash,
        );
        Self {
            id,
            file_path: file_path.to_string(),
            kind: extracted.kind,
            name: extracted.name.clone(),
            span: extracted.span,
            content_hash,
            variant,
            signature: extracted.signature.clone(),
            scope: extracted.scope.clone(),
            text: render_text(extracted, variant),
        }
    }
}

/// Text sent to the embedding provider. It leaves out the file path: a
/// rename keeps ids and vectors, so the text has to stay valid across it.
fn render_text(extracted: &ExtractedEntity, variant: ChunkVariant) -> String {
    let mut text = String::new();
    if let Some(scope) = &extracted.scope {
        text.push_str(&format!("# Scope: {}\n", scope));
    }
    text.push_str(&format!(
        "# {}: {} (lines {}-{})\n\n",
        extracted.kind.as_str(),
        extracted.name,
        extracted.span.start_line,
        extracted.span.end_line
    ));

    match variant {
        ChunkVariant::Metadata => {
            let signature = extracted
                .signature
                .clone()
                .unwrap_or_else(|| extracted.text.lines().next().unwrap_or_default().to_string());
            text.push_str(signature.trim_end());
        }
        ChunkVariant::Full => text.push_str(&extracted.text),
    }
    text
}

/// Validate extractor output and mint entities for every requested variant.
///
/// Entities with an empty name or text, or an invalid span, are dropped.
/// Duplicate ids (the same entity reported twice) are kept once.
pub fn mint_entities(
    file_path: &str,
    lineage: &str,
    extracted: &[ExtractedEntity],
    variants: &[ChunkVariant],
) -> Vec<Entity> {
    let mut seen = HashSet::new();
    let mut entities = Vec::new();

    for item in extracted {
        if item.name.trim().is_empty() || item.text.trim().is_empty() || !item.span.is_valid() {
            debug!(
                "Dropping invalid entity {:?} at {:?} in {}",
                item.name, item.span, file_path
            );
            continue;
        }
        for variant in variants {
            let entity = Entity::mint(file_path, lineage, item, *variant);
            if seen.insert(entity.id.clone()) {
                entities.push(entity);
            }
        }
    }

    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str, start: usize, text: &str) -> ExtractedEntity {
        ExtractedEntity {
            kind: EntityKind::Function,
            name: name.to_string(),
            span: Span::new(start, start + text.lines().count().saturating_sub(1)),
            signature: text.lines().next().map(|s| s.to_string()),
            scope: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_kind_as_str() {
        assert_eq!(EntityKind::Function.as_str(), "function");
        assert_eq!(EntityKind::Constant.as_str(), "constant");
        assert_eq!(ChunkVariant::Metadata.as_str(), "metadata");
    }

    #[test]
    fn test_id_is_128_bit_hex() {
        let e = Entity::mint("a.py", "lin", &func("a", 1, "def a():\n    pass"), ChunkVariant::Full);
        assert_eq!(e.id.len(), 32);
        assert!(e.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_id_stable_for_same_content() {
        let x = func("a", 3, "def a():\n    return 1");
        let first = Entity::mint("a.py", "lin", &x, ChunkVariant::Full);
        let second = Entity::mint("a.py", "lin", &x, ChunkVariant::Full);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_id_ignores_path_but_not_lineage() {
        let x = func("a", 1, "def a(): pass");
        let at_old = Entity::mint("old.py", "lin", &x, ChunkVariant::Full);
        let at_new = Entity::mint("new.py", "lin", &x, ChunkVariant::Full);
        assert_eq!(at_old.id, at_new.id);

        let copy = Entity::mint("copy.py", "other", &x, ChunkVariant::Full);
        assert_ne!(at_old.id, copy.id);
    }

    #[test]
    fn test_id_changes_with_content_and_variant() {
        let v1 = Entity::mint("a.py", "lin", &func("a", 1, "def a(): return 1"), ChunkVariant::Full);
        let v2 = Entity::mint("a.py", "lin", &func("a", 1, "def a(): return 2"), ChunkVariant::Full);
        let meta = Entity::mint("a.py", "lin", &func("a", 1, "def a(): return 1"), ChunkVariant::Metadata);
        assert_ne!(v1.id, v2.id);
        assert_ne!(v1.id, meta.id);
    }

    #[test]
    fn test_rendered_text() {
        let mut x = func("area", 10, "def area(self):\n    return self.w * self.h");
        x.kind = EntityKind::Method;
        x.scope = Some("class Rect".to_string());

        let full = Entity::mint("geo.py", "lin", &x, ChunkVariant::Full);
        assert!(full.text.starts_with("# Scope: class Rect\n"));
        assert!(full.text.contains("return self.w * self.h"));

        let meta = Entity::mint("geo.py", "lin", &x, ChunkVariant::Metadata);
        assert!(meta.text.contains("# method: area (lines 10-11)"));
        assert!(meta.text.ends_with("def area(self):"));
        assert!(!meta.text.contains("return"));
    }

    #[test]
    fn test_rendered_text_survives_rename() {
        let x = func("area", 3, "def area(self): return 1");
        let before = Entity::mint("geo.py", "lin", &x, ChunkVariant::Full);
        let after = Entity::mint("shapes/geo.py", "lin", &x, ChunkVariant::Full);
        assert_eq!(before.id, after.id);
        assert_eq!(before.text, after.text);
        assert!(!after.text.contains("geo.py"));
    }

    #[test]
    fn test_mint_entities_validates_and_dedups() {
        let good = func("a", 1, "def a(): pass");
        let empty_name = func("  ", 2, "def (): pass");
        let mut bad_span = func("b", 3, "def b(): pass");
        bad_span.span = Span::new(5, 4);
        let mut zero_line = func("c", 1, "def c(): pass");
        zero_line.span = Span::new(0, 1);

        let entities = mint_entities(
            "a.py",
            "lin",
            &[good.clone(), empty_name, bad_span, zero_line, good],
            &[ChunkVariant::Metadata, ChunkVariant::Full],
        );
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].variant, ChunkVariant::Metadata);
        assert_eq!(entities[1].variant, ChunkVariant::Full);
    }
}
