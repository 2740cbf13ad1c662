//! Extraction boundary and the tree-sitter adapter.
//!
//! An [`Extractor`] turns file content into [`ExtractedEntity`] values. It is
//! a pure function of path and content; ids are minted by the pipeline.

use std::path::Path;

use thiserror::Error;
use tree_sitter::{Language, Node, Parser};

use crate::entity::{EntityKind, ExtractedEntity, Span};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Unsupported file type: {0}")]
    Unsupported(String),

    #[error("Failed to load grammar for {language}: {reason}")]
    Grammar { language: String, reason: String },

    #[error("Failed to parse {0}")]
    Parse(String),
}

/// Parser boundary. Implementations must not keep per-call state.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &str, content: &str) -> Result<Vec<ExtractedEntity>, ExtractError>;

    /// Whether this extractor understands the file at all.
    fn supports(&self, path: &str) -> bool;
}

/// Languages the tree-sitter adapter ships grammars for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Go,
}

impl Lang {
    fn from_path(path: &str) -> Option<Self> {
        match Path::new(path).extension()?.to_str()? {
            "rs" => Some(Self::Rust),
            "py" => Some(Self::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "ts" => Some(Self::TypeScript),
            "tsx" => Some(Self::Tsx),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    fn grammar(self) -> Language {
        match self {
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
            Self::Go => "go",
        }
    }
}

/// Maps syntax nodes of supported languages onto entities.
///
/// A parser is created per call, so the extractor is `Sync` and can be shared
/// across the worker pool.
#[derive(Debug, Default, Clone)]
pub struct TreeSitterExtractor;

impl TreeSitterExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for TreeSitterExtractor {
    fn supports(&self, path: &str) -> bool {
        Lang::from_path(path).is_some()
    }

    fn extract(&self, path: &str, content: &str) -> Result<Vec<ExtractedEntity>, ExtractError> {
        let lang = Lang::from_path(path).ok_or_else(|| ExtractError::Unsupported(path.to_string()))?;

        let mut parser = Parser::new();
        parser
            .set_language(&lang.grammar())
            .map_err(|e| ExtractError::Grammar {
                language: lang.name().to_string(),
                reason: e.to_string(),
            })?;
        let tree = parser
            .parse(content, None)
            .ok_or_else(|| ExtractError::Parse(path.to_string()))?;

        let mut out = Vec::new();
        walk(tree.root_node(), content, None, &mut out);
        Ok(out)
    }
}

/// Scope a node is nested in, used to tell methods from free functions.
struct Scope {
    label: String,
    holds_methods: bool,
}

fn walk(node: Node, source: &str, scope: Option<&Scope>, out: &mut Vec<ExtractedEntity>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match classify(child, source, scope) {
            Some((kind, name)) => {
                let container = container_scope(kind, &name);
                out.push(to_entity(child, source, kind, name, scope));
                if let Some(inner) = container {
                    walk(child, source, Some(&inner), out);
                }
            }
            None => {
                // Declarations can sit below wrappers such as `export` or
                // decorators, or inside declaration lists.
                if descends(child.kind()) {
                    walk(child, source, scope, out);
                }
            }
        }
    }
}

fn descends(kind: &str) -> bool {
    matches!(
        kind,
        "declaration_list"
            | "block"
            | "class_body"
            | "export_statement"
            | "decorated_definition"
            | "interface_body"
            | "object_type"
            | "field_declaration_list"
            | "statement_block"
            | "program"
            | "source_file"
            | "module"
    )
}

fn classify(node: Node, source: &str, scope: Option<&Scope>) -> Option<(EntityKind, String)> {
    let in_scope = scope.map(|s| s.holds_methods).unwrap_or(false);
    let named = |field: &str| field_text(node, field, source);

    let result = match node.kind() {
        // Rust
        "function_item" | "function_signature_item" => {
            let kind = if in_scope { EntityKind::Method } else { EntityKind::Function };
            (kind, named("name")?)
        }
        "struct_item" => (EntityKind::Struct, named("name")?),
        "enum_item" => (EntityKind::Enum, named("name")?),
        "trait_item" => (EntityKind::Trait, named("name")?),
        "impl_item" => {
            let ty = named("type")?;
            let name = match named("trait") {
                Some(tr) => format!("{} for {}", tr, ty),
                None => ty,
            };
            (EntityKind::Impl, name)
        }
        "const_item" | "static_item" => (EntityKind::Constant, named("name")?),
        "mod_item" if node.child_by_field_name("body").is_some() => {
            (EntityKind::Module, named("name")?)
        }

        // Python
        "function_definition" => {
            let kind = if in_scope { EntityKind::Method } else { EntityKind::Function };
            (kind, named("name")?)
        }
        "class_definition" => (EntityKind::Class, named("name")?),

        // JavaScript / TypeScript
        "function_declaration" | "generator_function_declaration" => {
            (EntityKind::Function, named("name")?)
        }
        "class_declaration" | "abstract_class_declaration" => (EntityKind::Class, named("name")?),
        "method_definition" => (EntityKind::Method, named("name")?),
        "interface_declaration" => (EntityKind::Interface, named("name")?),
        "enum_declaration" => (EntityKind::Enum, named("name")?),

        // Go
        "method_declaration" => (EntityKind::Method, named("name")?),
        "type_declaration" => go_type(node, source)?,
        "const_declaration" => {
            let spec = first_child_of_kind(node, "const_spec")?;
            (EntityKind::Constant, field_text(spec, "name", source)?)
        }

        _ => return None,
    };
    Some(result)
}

fn go_type(node: Node, source: &str) -> Option<(EntityKind, String)> {
    let spec = first_child_of_kind(node, "type_spec")?;
    let name = field_text(spec, "name", source)?;
    let kind = match spec.child_by_field_name("type").map(|t| t.kind()) {
        Some("interface_type") => EntityKind::Interface,
        _ => EntityKind::Struct,
    };
    Some((kind, name))
}

/// Containers whose members are reported as separate entities.
fn container_scope(kind: EntityKind, name: &str) -> Option<Scope> {
    let (label, holds_methods) = match kind {
        EntityKind::Impl => (format!("impl {}", name), true),
        EntityKind::Trait => (format!("trait {}", name), true),
        EntityKind::Class => (format!("class {}", name), true),
        EntityKind::Module => (format!("mod {}", name), false),
        _ => return None,
    };
    Some(Scope {
        label,
        holds_methods,
    })
}

fn to_entity(
    node: Node,
    source: &str,
    kind: EntityKind,
    name: String,
    scope: Option<&Scope>,
) -> ExtractedEntity {
    let text = source[node.byte_range()].to_string();
    ExtractedEntity {
        kind,
        name,
        span: Span::new(node.start_position().row + 1, node.end_position().row + 1),
        signature: signature_of(&text, kind),
        scope: scope.map(|s| s.label.clone()),
        text,
    }
}

fn signature_of(text: &str, kind: EntityKind) -> Option<String> {
    match kind {
        EntityKind::Function | EntityKind::Method => {
            text.lines().next().map(|l| l.trim().trim_end_matches('{').trim().to_string())
        }
        EntityKind::Constant | EntityKind::Module => text.lines().next().map(|l| l.trim().to_string()),
        _ => {
            let head = match text.find('{') {
                Some(pos) => &text[..pos],
                None => text.lines().next().unwrap_or_default(),
            };
            Some(head.trim().trim_end_matches(':').to_string())
        }
    }
}

fn field_text(node: Node, field: &str, source: &str) -> Option<String> {
    let child = node.child_by_field_name(field)?;
    let text = source[child.byte_range()].trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn first_child_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find(|c| c.kind() == kind);
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entities: &[ExtractedEntity]) -> Vec<(EntityKind, String)> {
        entities.iter().map(|e| (e.kind, e.name.clone())).collect()
    }

    #[test]
    fn test_supports() {
        let x = TreeSitterExtractor::new();
        assert!(x.supports("src/lib.rs"));
        assert!(x.supports("app/component.tsx"));
        assert!(!x.supports("README.md"));
    }

    #[test]
    fn test_unsupported_file() {
        let err = TreeSitterExtractor::new().extract("notes.txt", "hello").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn test_extract_rust() {
        let source = r#"
pub struct Point {
    x: i32,
}

impl Point {
    pub fn new(x: i32) -> Self {
        Self { x }
    }
}

const LIMIT: usize = 10;

fn helper() -> usize {
    LIMIT
}
"#;
        let entities = TreeSitterExtractor::new().extract("src/point.rs", source).unwrap();
        let found = names(&entities);
        assert!(found.contains(&(EntityKind::Struct, "Point".to_string())));
        assert!(found.contains(&(EntityKind::Impl, "Point".to_string())));
        assert!(found.contains(&(EntityKind::Method, "new".to_string())));
        assert!(found.contains(&(EntityKind::Constant, "LIMIT".to_string())));
        assert!(found.contains(&(EntityKind::Function, "helper".to_string())));

        let method = entities.iter().find(|e| e.name == "new").unwrap();
        assert_eq!(method.scope.as_deref(), Some("impl Point"));
        assert_eq!(method.span, Span::new(7, 9));
        assert_eq!(method.signature.as_deref(), Some("pub fn new(x: i32) -> Self"));
    }

    #[test]
    fn test_extract_python_methods() {
        let source = "class Rect:\n    def area(self):\n        return 1\n\ndef main():\n    pass\n";
        let entities = TreeSitterExtractor::new().extract("geo.py", source).unwrap();
        let found = names(&entities);
        assert_eq!(
            found,
            vec![
                (EntityKind::Class, "Rect".to_string()),
                (EntityKind::Method, "area".to_string()),
                (EntityKind::Function, "main".to_string()),
            ]
        );
        assert_eq!(entities[1].scope.as_deref(), Some("class Rect"));
    }

    #[test]
    fn test_extract_typescript() {
        let source = "export interface Shape { area(): number; }\n\nexport class Square {\n  side = 1;\n  area() { return this.side; }\n}\n";
        let entities = TreeSitterExtractor::new().extract("shape.ts", source).unwrap();
        let found = names(&entities);
        assert!(found.contains(&(EntityKind::Interface, "Shape".to_string())));
        assert!(found.contains(&(EntityKind::Class, "Square".to_string())));
        assert!(found.contains(&(EntityKind::Method, "area".to_string())));
    }

    #[test]
    fn test_extract_go() {
        let source = "package main\n\ntype Server struct {\n\tport int\n}\n\nfunc (s *Server) Start() error {\n\treturn nil\n}\n\nfunc main() {}\n";
        let entities = TreeSitterExtractor::new().extract("main.go", source).unwrap();
        let found = names(&entities);
        assert!(found.contains(&(EntityKind::Struct, "Server".to_string())));
        assert!(found.contains(&(EntityKind::Method, "Start".to_string())));
        assert!(found.contains(&(EntityKind::Function, "main".to_string())));
    }

    #[test]
    fn test_functions_in_module_are_not_methods() {
        let source = "mod util {\n    pub fn clamp(v: i32) -> i32 {\n        v\n    }\n}\n";
        let entities = TreeSitterExtractor::new().extract("src/util.rs", source).unwrap();
        let clamp = entities.iter().find(|e| e.name == "clamp").unwrap();
        assert_eq!(clamp.kind, EntityKind::Function);
        assert_eq!(clamp.scope.as_deref(), Some("mod util"));
    }

    #[test]
    fn test_empty_file_has_no_entities() {
        let entities = TreeSitterExtractor::new().extract("empty.py", "").unwrap();
        assert!(entities.is_empty());
    }
}
