//! Lexer-based occurrence extraction, used when no AST is available.

use std::collections::HashMap;

use crate::model::{line_snippet, UsageKind};

use super::lexer::{scan_tokens, Token, TokenKind};
use super::{
    build_import_maps, resolve_receiver_group, resolve_symbol_group, JavaImport, JavaOccurrence,
    JavaOccurrenceExtractor, SNIPPET_MAX_LEN,
};

#[derive(Debug, Default)]
pub struct HeuristicExtractor;

impl JavaOccurrenceExtractor for HeuristicExtractor {
    fn extract(
        &self,
        src: &str,
        lines: &[String],
        imports: &[JavaImport],
        group_ids: &[String],
    ) -> Vec<JavaOccurrence> {
        extract_occurrences(src, lines, imports, group_ids)
    }
}

pub(crate) fn extract_occurrences(
    src: &str,
    lines: &[String],
    imports: &[JavaImport],
    group_ids: &[String],
) -> Vec<JavaOccurrence> {
    let (type_to_group, static_member_to_group) = build_import_maps(imports, group_ids);
    let tokens = scan_tokens(src);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut var_to_group: HashMap<String, String> = HashMap::new();
    let mut occurrences = Vec::new();

    let occurrence_at = |token: &Token, kind: UsageKind, confidence: f64| JavaOccurrence {
        group_id: String::new(),
        line: token.line,
        col: token.col,
        end_line: token.line,
        end_col: token.col,
        kind,
        snippet: line_snippet(lines, token.line, SNIPPET_MAX_LEN),
        symbol: String::new(),
        receiver: String::new(),
        callee: String::new(),
        confidence,
    };

    let mut i = 0usize;
    while i < tokens.len() {
        let token = &tokens[i];

        // @Annotation
        if token.kind == TokenKind::Symbol && token.text == "@" {
            if let Some(next) = tokens.get(i + 1) {
                if next.kind == TokenKind::Ident {
                    if let Some(group) = type_to_group.get(&next.text) {
                        let mut occ = occurrence_at(token, UsageKind::Annotation, 0.8);
                        occ.group_id = group.clone();
                        occ.symbol = next.text.clone();
                        occurrences.push(occ);
                    }
                }
            }
            i += 1;
            continue;
        }

        if token.kind != TokenKind::Ident {
            i += 1;
            continue;
        }

        // Variable declaration for an imported type: Type name [=|;|,|)|[]
        if let Some(group) = type_to_group.get(&token.text) {
            if let (Some(name), Some(after)) = (tokens.get(i + 1), tokens.get(i + 2)) {
                if name.kind == TokenKind::Ident
                    && matches!(after.text.as_str(), "=" | ";" | "," | ")" | "[")
                {
                    var_to_group.insert(name.text.clone(), group.clone());
                    let mut occ = occurrence_at(token, UsageKind::Type, 0.7);
                    occ.group_id = group.clone();
                    occ.symbol = token.text.clone();
                    occurrences.push(occ);
                }
            }
        }

        // new Dotted.Name(...)
        if token.text == "new" && i + 1 < tokens.len() {
            let (end, parts) = parse_dotted_parts(&tokens, i + 1);
            let type_name = parts.join(".");
            let group = resolve_symbol_group(&type_name, group_ids, &type_to_group);
            if !group.is_empty() {
                let mut occ = occurrence_at(token, UsageKind::New, 0.8);
                occ.group_id = group;
                occ.symbol = type_name;
                occurrences.push(occ);
            }
            i = end.max(i + 1);
            continue;
        }

        // Dotted identifier chain; a trailing `(` makes it a call.
        let (end, parts) = parse_dotted_parts(&tokens, i);
        if parts.is_empty() {
            i += 1;
            continue;
        }
        if tokens.get(end).map(|t| t.text.as_str()) == Some("(") {
            let method_name = parts.last().cloned().unwrap_or_default();
            let receiver_parts = &parts[..parts.len() - 1];
            if !receiver_parts.is_empty() {
                let receiver = receiver_parts.join(".");
                let (group, confidence) =
                    resolve_receiver_group(&receiver, group_ids, &type_to_group, &var_to_group);
                if !group.is_empty() {
                    let mut occ = occurrence_at(token, UsageKind::Call, confidence);
                    occ.group_id = group;
                    occ.receiver = receiver;
                    occ.callee = method_name.clone();
                    occ.symbol = method_name;
                    occurrences.push(occ);
                }
            } else if let Some(group) = static_member_to_group.get(&method_name) {
                let mut occ = occurrence_at(token, UsageKind::Call, 0.6);
                occ.group_id = group.clone();
                occ.callee = method_name.clone();
                occ.symbol = method_name;
                occurrences.push(occ);
            }
        }
        i = end.max(i + 1);
    }

    occurrences
}

/// Consume `ident(.ident)*` starting at `start`; returns the index after the
/// chain and its segments.
fn parse_dotted_parts(tokens: &[Token], start: usize) -> (usize, Vec<String>) {
    let Some(first) = tokens.get(start) else {
        return (start, Vec::new());
    };
    if first.kind != TokenKind::Ident {
        return (start, Vec::new());
    }
    let mut parts = vec![first.text.clone()];
    let mut i = start + 1;
    while i + 1 < tokens.len() && tokens[i].text == "." && tokens[i + 1].kind == TokenKind::Ident {
        parts.push(tokens[i + 1].text.clone());
        i += 2;
    }
    (i, parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::java::scan_java_imports;

    const SRC: &str = r#"package demo;

import org.apache.commons.lang3.StringUtils;
import static org.apache.commons.lang3.Validate.notNull;

@Component
public class A {
    StringUtils helper;

    void run(String s) {
        StringUtils util = helper;
        if (StringUtils.isEmpty(s)) {
            notNull(s);
        }
        util.chomp(s);
        new org.apache.commons.lang3.StringRange();
    }
}
"#;

    fn extract() -> Vec<JavaOccurrence> {
        let lines: Vec<String> = SRC.lines().map(str::to_string).collect();
        let groups = vec!["org.apache.commons".to_string()];
        let (imports, _) = scan_java_imports(&lines, &groups);
        extract_occurrences(SRC, &lines, &imports, &groups)
    }

    #[test]
    fn test_static_call_via_imported_type() {
        let occurrences = extract();
        let call = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Call && o.callee == "isEmpty")
            .expect("isEmpty call");
        assert_eq!(call.receiver, "StringUtils");
        assert_eq!(call.confidence, 0.75);
        assert!(call.snippet.contains("isEmpty"));
    }

    #[test]
    fn test_static_import_member_call() {
        let occurrences = extract();
        let call = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Call && o.callee == "notNull")
            .expect("notNull call");
        assert!(call.receiver.is_empty());
        assert_eq!(call.confidence, 0.6);
    }

    #[test]
    fn test_variable_binding_call() {
        let occurrences = extract();
        let call = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::Call && o.callee == "chomp")
            .expect("chomp call");
        assert_eq!(call.receiver, "util");
        assert_eq!(call.confidence, 0.65);
    }

    #[test]
    fn test_type_declaration_recorded() {
        let occurrences = extract();
        assert!(occurrences
            .iter()
            .any(|o| o.kind == UsageKind::Type && o.symbol == "StringUtils"));
    }

    #[test]
    fn test_fully_qualified_new() {
        let occurrences = extract();
        let new_occ = occurrences
            .iter()
            .find(|o| o.kind == UsageKind::New)
            .expect("new occurrence");
        assert_eq!(new_occ.symbol, "org.apache.commons.lang3.StringRange");
        assert_eq!(new_occ.confidence, 0.8);
    }

    #[test]
    fn test_unrelated_annotation_ignored() {
        // @Component is not an imported type of a tracked group.
        assert!(!extract().iter().any(|o| o.kind == UsageKind::Annotation));
    }
}
