use tree_sitter::{Node, Parser, Tree};

use crate::{ParseError, SourceOutline, SyntaxReport};

pub(crate) const IMPORT_KINDS: &[&str] = &["import_statement", "import_from_statement"];

pub(crate) fn parse_python(source: &str) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|_| ParseError::Grammar("python"))?;
    parser.parse(source, None).ok_or(ParseError::NoTree)
}

pub fn python_syntax(source: &str) -> Result<SyntaxReport, ParseError> {
    let tree = parse_python(source)?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(SyntaxReport::valid());
    }

    Ok(SyntaxReport {
        valid: false,
        error_line: first_error_node(root).map(|node| node.start_position().row + 1),
    })
}

pub fn python_outline(source: &str) -> Result<SourceOutline, ParseError> {
    let tree = parse_python(source)?;
    let root = tree.root_node();
    let mut outline = SourceOutline::default();

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        match child.kind() {
            kind if IMPORT_KINDS.contains(&kind) || kind == "future_import_statement" => {
                let start = child.start_position().row + 1;
                let end = child.end_position().row + 1;
                outline.import_lines.extend(start..=end);
            }
            "function_definition" | "class_definition" => {
                outline.signature_lines.push(child.start_position().row + 1);
            }
            "decorated_definition" => {
                let line = child
                    .child_by_field_name("definition")
                    .unwrap_or(child)
                    .start_position()
                    .row
                    + 1;
                outline.signature_lines.push(line);
            }
            _ => {}
        }
    }

    Ok(outline)
}

fn first_error_node(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }

    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error_node)
}
