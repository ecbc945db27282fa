use super::{Ast, NodeId, NodeKind};
use std::fmt::Write;

impl Ast {
    /// Render the tree one node per line, indented by depth
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(self.root(), 0, "", &mut out);
        if let Some(agg) = &self.aggregate {
            let _ = writeln!(out, "#{}({})", agg.name(), agg.fieldname);
        }
        out
    }

    fn dump_node(&self, id: NodeId, depth: usize, label: &str, out: &mut String) {
        let node = self.node(id);
        let _ = write!(out, "{}{}{}", "   ".repeat(depth), label, node.kind.name());

        match &node.kind {
            NodeKind::Expansion(e) => {
                let _ = write!(out, " {}", self.links.get(e.link));
                if e.generated {
                    out.push_str(" generated");
                }
                if let Some(hits) = e.hit_count {
                    let _ = write!(out, " hits={}", hits);
                }
            }
            NodeKind::Proximity { distance, ordered } => {
                let _ = write!(out, " {}/{}", if *ordered { "wo" } else { "w" }, distance);
            }
            NodeKind::NestedGroup { path } => {
                let _ = write!(out, " path={}", path);
            }
            _ => {}
        }

        if let Some(field) = &node.fieldname {
            let _ = write!(out, " ({}{}", field, node.operator.symbol());
            match &node.kind {
                NodeKind::Boolean(b) => {
                    let _ = write!(out, "{}", b);
                }
                NodeKind::Null => out.push_str("null"),
                NodeKind::NotNull => out.push_str("<not null>"),
                NodeKind::Fuzzy { value, distance } => {
                    let _ = write!(out, "\"{}\"~{}", value, distance);
                }
                NodeKind::Array { and, external } => {
                    let sep = if *and { " & " } else { ", " };
                    match external {
                        Some(values) => {
                            let _ = write!(out, "[[{}]]", values.join(sep));
                        }
                        None => out.push_str(if *and { "&[..]" } else { "[..]" }),
                    }
                }
                kind => {
                    if let Some(text) = kind.text() {
                        let _ = write!(out, "\"{}\"", text);
                    }
                }
            }
            out.push(')');
        }

        if let Some(boost) = node.boost {
            let _ = write!(out, "^{}", boost);
        }
        if let Some(owner) = node.owning_index {
            let _ = write!(out, " index={}", self.links.get(owner).index_name);
        }
        out.push('\n');

        for &child in self.children(id) {
            self.dump_node(child, depth + 1, "", out);
        }
        if let Some(filter) = self.filter(id) {
            self.dump_node(filter, depth + 1, "#filter ", out);
        }
    }
}
