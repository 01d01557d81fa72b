//! Graphviz rendering of compiled machines, for the `dotify` command.

use crate::machine::Machine;

impl Machine {
    /// Render every process automaton as one dot digraph with a cluster
    /// per process. Forbidden states are drawn with a double circle.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph machine {\n  rankdir=TB;\n  node [shape=circle];\n");
        for (pid, aut) in self.automata.iter().enumerate() {
            out.push_str(&format!(
                "  subgraph cluster_p{pid} {{\n    label=\"P{pid}\";\n"
            ));
            for state in 0..aut.states.len() {
                let forbidden = self.forbidden.iter().any(|tuple| tuple[pid] == state);
                let shape = if forbidden { "doublecircle" } else { "circle" };
                out.push_str(&format!(
                    "    p{pid}s{state} [label=\"{}\", shape={shape}];\n",
                    escape(&aut.state_name(state))
                ));
            }
            for t in &aut.transitions {
                out.push_str(&format!(
                    "    p{pid}s{} -> p{pid}s{} [label=\"{}\"];\n",
                    t.source,
                    t.target,
                    escape(&self.pretty_string_instr(pid, &t.instr))
                ));
            }
            out.push_str("  }\n");
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
