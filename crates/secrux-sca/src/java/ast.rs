//! Tree-sitter based occurrence extraction.
//!
//! Preferred over the lexer heuristic: node ranges are exact and receiver
//! resolution sees real declaration structure. Parse failures and empty
//! results fall back to the heuristic so both paths emit the same shape.

use std::collections::HashMap;

use tracing::debug;
use tree_sitter::{Node, Parser};

use crate::model::{line_snippet, UsageKind};

use super::{
    build_import_maps, heuristic, normalize_type_name, resolve_receiver_group,
    resolve_symbol_group, JavaImport, JavaOccurrence, JavaOccurrenceExtractor, SNIPPET_MAX_LEN,
};

#[derive(Debug, Default)]
pub struct AstExtractor;

impl JavaOccurrenceExtractor for AstExtractor {
    fn extract(
        &self,
        src: &str,
        lines: &[String],
        imports: &[JavaImport],
        group_ids: &[String],
    ) -> Vec<JavaOccurrence> {
        let mut parser = Parser::new();
        if parser
            .set_language(&tree_sitter_java::LANGUAGE.into())
            .is_err()
        {
            return heuristic::extract_occurrences(src, lines, imports, group_ids);
        }
        let Some(tree) = parser.parse(src, None) else {
            debug!("java parse failed, falling back to heuristic extraction");
            return heuristic::extract_occurrences(src, lines, imports, group_ids);
        };

        let occurrences = extract_from_tree(tree.root_node(), src, lines, imports, group_ids);
        if occurrences.is_empty() {
            return heuristic::extract_occurrences(src, lines, imports, group_ids);
        }
        occurrences
    }
}

fn extract_from_tree(
    root: Node<'_>,
    src: &str,
    lines: &[String],
    imports: &[JavaImport],
    group_ids: &[String],
) -> Vec<JavaOccurrence> {
    let (type_to_group, static_member_to_group) = build_import_maps(imports, group_ids);
    let mut var_to_group: HashMap<String, String> = HashMap::new();
    let mut occurrences = Vec::new();

    // First pass: declarations bind variables to groups and emit `type`
    // occurrences.
    walk_named_nodes(root, &mut |node| {
        if !matches!(
            node.kind(),
            "local_variable_declaration"
                | "field_declaration"
                | "formal_parameter"
                | "catch_formal_parameter"
                | "resource"
        ) {
            return;
        }
        let Some(type_node) = find_type_node(node) else {
            return;
        };
        let type_name = normalize_type_name(node_text(type_node, src));
        if type_name.is_empty() {
            return;
        }
        let group = resolve_symbol_group(&type_name, group_ids, &type_to_group);
        if group.is_empty() {
            return;
        }

        let (line, col, end_line, end_col) = node_range(type_node);
        occurrences.push(JavaOccurrence {
            group_id: group.clone(),
            line,
            col,
            end_line,
            end_col,
            kind: UsageKind::Type,
            snippet: line_snippet(lines, line, SNIPPET_MAX_LEN),
            symbol: type_name,
            receiver: String::new(),
            callee: String::new(),
            confidence: 0.75,
        });

        for name in declared_variable_names(node, src) {
            var_to_group.entry(name).or_insert_with(|| group.clone());
        }
    });

    // Second pass: calls, object creation, annotations.
    walk_named_nodes(root, &mut |node| match node.kind() {
        "method_invocation" => {
            let name_node = node
                .child_by_field_name("name")
                .or_else(|| find_last_named_child(node, "identifier"));
            let Some(name_node) = name_node else { return };
            let method_name = node_text(name_node, src).trim().to_string();
            if method_name.is_empty() {
                return;
            }

            if let Some(object_node) = node.child_by_field_name("object") {
                let receiver = node_text(object_node, src).trim().to_string();
                let (group, confidence) =
                    resolve_receiver_group(&receiver, group_ids, &type_to_group, &var_to_group);
                if group.is_empty() {
                    return;
                }
                let (line, col, end_line, end_col) = node_range(node);
                occurrences.push(JavaOccurrence {
                    group_id: group,
                    line,
                    col,
                    end_line,
                    end_col,
                    kind: UsageKind::Call,
                    snippet: line_snippet(lines, line, SNIPPET_MAX_LEN),
                    symbol: method_name.clone(),
                    receiver,
                    callee: method_name,
                    confidence,
                });
                return;
            }

            if let Some(group) = static_member_to_group.get(&method_name) {
                let (line, col, end_line, end_col) = node_range(node);
                occurrences.push(JavaOccurrence {
                    group_id: group.clone(),
                    line,
                    col,
                    end_line,
                    end_col,
                    kind: UsageKind::Call,
                    snippet: line_snippet(lines, line, SNIPPET_MAX_LEN),
                    symbol: method_name.clone(),
                    receiver: String::new(),
                    callee: method_name,
                    confidence: 0.6,
                });
            }
        }
        "object_creation_expression" => {
            let type_node = node.child_by_field_name("type").or_else(|| find_type_node(node));
            let Some(type_node) = type_node else { return };
            let type_name = normalize_type_name(node_text(type_node, src));
            if type_name.is_empty() {
                return;
            }
            let group = resolve_symbol_group(&type_name, group_ids, &type_to_group);
            if group.is_empty() {
                return;
            }
            let (line, col, end_line, end_col) = node_range(node);
            occurrences.push(JavaOccurrence {
                group_id: group,
                line,
                col,
                end_line,
                end_col,
                kind: UsageKind::New,
                snippet: line_snippet(lines, line, SNIPPET_MAX_LEN),
                symbol: type_name,
                receiver: String::new(),
                callee: String::new(),
                confidence: 0.85,
            });
        }
        "marker_annotation" | "annotation" => {
            let name_node = node.child_by_field_name("name").or_else(|| {
                find_first_named_child_of(node, &["scoped_identifier", "identifier", "type_identifier"])
            });
            let Some(name_node) = name_node else { return };
            let name = node_text(name_node, src).trim().to_string();
            if name.is_empty() {
                return;
            }
            let group = resolve_symbol_group(&name, group_ids, &type_to_group);
            if group.is_empty() {
                return;
            }
            let (line, col, end_line, end_col) = node_range(node);
            occurrences.push(JavaOccurrence {
                group_id: group,
                line,
                col,
                end_line,
                end_col,
                kind: UsageKind::Annotation,
                snippet: line_snippet(lines, line, SNIPPET_MAX_LEN),
                symbol: name,
                receiver: String::new(),
                callee: String::new(),
                confidence: 0.8,
            });
        }
        _ => {}
    });

    occurrences
}

/// Iterative depth-first walk over named nodes.
fn walk_named_nodes<'a>(root: Node<'a>, visit: &mut dyn FnMut(Node<'a>)) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        visit(node);
        for index in (0..node.named_child_count()).rev() {
            if let Some(child) = node.named_child(index) {
                stack.push(child);
            }
        }
    }
}

fn node_text<'a>(node: Node<'_>, src: &'a str) -> &'a str {
    node.utf8_text(src.as_bytes()).unwrap_or_default()
}

/// 1-based (start_line, start_col, end_line, end_col).
fn node_range(node: Node<'_>) -> (usize, usize, usize, usize) {
    let start = node.start_position();
    let end = node.end_position();
    (start.row + 1, start.column + 1, end.row + 1, end.column + 1)
}

fn find_type_node(node: Node<'_>) -> Option<Node<'_>> {
    if let Some(typed) = node.child_by_field_name("type") {
        return Some(typed);
    }
    (0..node.named_child_count())
        .filter_map(|index| node.named_child(index))
        .find(|child| is_type_node(child.kind()))
}

fn find_first_named_child_of<'a>(node: Node<'a>, kinds: &[&str]) -> Option<Node<'a>> {
    (0..node.named_child_count())
        .filter_map(|index| node.named_child(index))
        .find(|child| kinds.contains(&child.kind()))
}

fn find_last_named_child<'a>(node: Node<'a>, kind: &str) -> Option<Node<'a>> {
    (0..node.named_child_count())
        .rev()
        .filter_map(|index| node.named_child(index))
        .find(|child| child.kind() == kind)
}

fn is_type_node(kind: &str) -> bool {
    matches!(
        kind,
        "type_identifier"
            | "scoped_type_identifier"
            | "generic_type"
            | "array_type"
            | "annotated_type"
            | "integral_type"
            | "floating_point_type"
            | "boolean_type"
            | "void_type"
    )
}

/// Names bound by a declaration node.
fn declared_variable_names(node: Node<'_>, src: &str) -> Vec<String> {
    if matches!(node.kind(), "formal_parameter" | "catch_formal_parameter") {
        return first_identifier(node, src).into_iter().collect();
    }

    let mut names = Vec::new();
    for index in 0..node.named_child_count() {
        let Some(child) = node.named_child(index) else { continue };
        if child.kind() == "variable_declarator" {
            if let Some(name) = declarator_name(child, src) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        walk_named_nodes(node, &mut |child| {
            if child.kind() == "variable_declarator" {
                if let Some(name) = declarator_name(child, src) {
                    names.push(name);
                }
            }
        });
    }
    names.sort();
    names.dedup();
    names
}

fn declarator_name(node: Node<'_>, src: &str) -> Option<String> {
    let name = node
        .child_by_field_name("name")
        .or_else(|| node.named_child(0))?;
    if name.kind() == "identifier" {
        let text = node_text(name, src).trim();
        return (!text.is_empty()).then(|| text.to_string());
    }
    first_identifier(name, src)
}

fn first_identifier(node: Node<'_>, src: &str) -> Option<String> {
    let mut found = None;
    walk_named_nodes(node, &mut |child| {
        if found.is_none() && child.kind() == "identifier" {
            let text = node_text(child, src).trim();
            if !text.is_empty() {
                found = Some(text.to_string());
            }
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::java::scan_java_imports;

    const SRC: &str = r#"package demo;

import org.apache.commons.lang3.StringUtils;
import org.apache.commons.lang3.builder.ToStringBuilder;
import static org.apache.commons.lang3.Validate.notNull;

public class A {
    void run(String s, StringUtils passed) {
        StringUtils util = null;
        if (StringUtils.isEmpty(s)) {
            notNull(s);
        }
        util.chomp(s);
        ToStringBuilder builder = new ToStringBuilder(this);
        try {
        } catch (RuntimeException e) {
        }
    }
}
"#;

    fn extract() -> Vec<JavaOccurrence> {
        let lines: Vec<String> = SRC.lines().map(str::to_string).collect();
        let groups = vec!["org.apache.commons".to_string()];
        let (imports, _) = scan_java_imports(&lines, &groups);
        AstExtractor.extract(SRC, &lines, &imports, &groups)
    }

    #[test]
    fn test_type_declarations_with_ranges() {
        let occurrences = extract();
        let type_occ = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Type && o.symbol == "StringUtils" && o.line == 9)
            .expect("StringUtils local declaration");
        assert!(type_occ.col >= 1);
        assert_eq!(type_occ.confidence, 0.75);
    }

    #[test]
    fn test_static_type_call() {
        let occurrences = extract();
        let call = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Call && o.callee == "isEmpty")
            .expect("isEmpty call");
        assert_eq!(call.receiver, "StringUtils");
        assert_eq!(call.confidence, 0.75);
        assert_eq!(call.line, 10);
    }

    #[test]
    fn test_variable_receiver_call() {
        let occurrences = extract();
        let call = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Call && o.callee == "chomp")
            .expect("chomp call");
        assert_eq!(call.receiver, "util");
        assert_eq!(call.confidence, 0.65);
    }

    #[test]
    fn test_static_import_call() {
        let occurrences = extract();
        let call = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Call && o.callee == "notNull")
            .expect("notNull call");
        assert_eq!(call.confidence, 0.6);
    }

    #[test]
    fn test_object_creation() {
        let occurrences = extract();
        let new_occ = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::New)
            .expect("new occurrence");
        assert_eq!(new_occ.symbol, "ToStringBuilder");
        assert_eq!(new_occ.confidence, 0.85);
    }

    #[test]
    fn test_parameter_binds_variable() {
        let occurrences = extract();
        // `passed` is a formal parameter of an imported type; its type
        // occurrence is recorded.
        assert!(occurrences
            .iter()
            .any(|o| o.kind == UsageKind::Type && o.line == 8));
    }

    #[test]
    fn test_garbage_input_falls_back_to_heuristic() {
        let src = "import org.apache.commons.lang3.StringUtils; StringUtils.isEmpty(x);";
        let lines: Vec<String> = src.lines().map(str::to_string).collect();
        let groups = vec!["org.apache.commons".to_string()];
        let (imports, _) = scan_java_imports(&lines, &groups);
        let occurrences = AstExtractor.extract(src, &lines, &imports, &groups);
        assert!(occurrences.iter().any(|o| o.callee == "isEmpty"));
    }
}
