//! KDL parsing helper functions.

/// Convert a byte offset to line and column numbers (1-indexed)
pub fn offset_to_line_col(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in content.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// First argument of the child node `name`
fn first_child_value<'a>(node: &'a kdl::KdlNode, name: &str) -> Option<&'a kdl::KdlValue> {
    node.children()
        .and_then(|children| children.get(name))
        .and_then(|n| n.entries().first())
        .map(|e| e.value())
}

/// Helper to get a string entry from a KDL node
pub fn get_string_entry(node: &kdl::KdlNode, name: &str) -> Option<String> {
    first_child_value(node, name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Helper to get an integer entry from a KDL node
pub fn get_int_entry(node: &kdl::KdlNode, name: &str) -> Option<i128> {
    first_child_value(node, name).and_then(|v| v.as_integer())
}

/// Helper to get a boolean entry from a KDL node
pub fn get_bool_entry(node: &kdl::KdlNode, name: &str) -> Option<bool> {
    first_child_value(node, name).and_then(|v| v.as_bool())
}

/// Render a scalar KDL value as a setting string
pub fn value_to_string(value: &kdl::KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        Some(s.to_string())
    } else if let Some(i) = value.as_integer() {
        Some(i.to_string())
    } else {
        value.as_bool().map(|b| b.to_string())
    }
}
