use std::fmt::Write as _;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::composition::{Role, System};
use crate::model::{MechanismId, Model};
use crate::projection::ProjectionKind;
use crate::value::Value;

/// A read-only snapshot of a System between trials.
///
/// Observers cannot mutate or steer the system; snapshots allocate and are
/// meant for inspection, logging and tests.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemSnapshot {
    pub name: String,
    pub execution: u64,
    pub mechanisms: Vec<MechanismSnapshot>,
    pub deferred_projections: usize,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MechanismSnapshot {
    pub id: MechanismId,
    pub name: String,
    pub kind: String,
    pub roles: Vec<Role>,
    pub value: Vec<Value>,
    pub output_values: Vec<Value>,
    /// Effective (modulated) parameter values.
    pub parameters: Vec<(String, Value)>,
    pub execution_count: u64,
}

impl SystemSnapshot {
    pub fn mechanism(&self, name: &str) -> Option<&MechanismSnapshot> {
        self.mechanisms.iter().find(|m| m.name == name)
    }
}

/// Which adaptive layers `show_graph` draws besides processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphOptions {
    pub show_learning: bool,
    pub show_control: bool,
    pub show_gating: bool,
}

impl GraphOptions {
    pub fn all() -> Self {
        Self {
            show_learning: true,
            show_control: true,
            show_gating: true,
        }
    }
}

pub struct SystemAdapter<'a> {
    system: &'a System,
}

impl<'a> SystemAdapter<'a> {
    pub fn new(system: &'a System) -> Self {
        Self { system }
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        let model = self.system.model();
        let mechanisms = self
            .system
            .members()
            .into_iter()
            .filter_map(|id| {
                let m = model.mechanism(id).ok()?;
                let parameters = m
                    .parameter_states()
                    .iter()
                    .filter_map(|s| model.state(*s).ok())
                    .map(|s| (s.name().to_string(), s.value().clone()))
                    .collect();
                Some(MechanismSnapshot {
                    id,
                    name: m.name().to_string(),
                    kind: m.kind().label().to_string(),
                    roles: self.system.roles(id).to_vec(),
                    value: m.value().to_vec(),
                    output_values: model.output_values(id).unwrap_or_default(),
                    parameters,
                    execution_count: m.execution_count(),
                })
            })
            .collect();

        SystemSnapshot {
            name: self.system.name().to_string(),
            execution: self.system.execution_id().0,
            mechanisms,
            deferred_projections: model.deferred_projections().len(),
        }
    }

    /// Graphviz DOT text. Processing mechanisms and the pathway projections
    /// between them are always drawn.
    pub fn show_graph(&self, options: GraphOptions) -> String {
        let model = self.system.model();
        let layer_visible = |m: MechanismId| -> bool {
            let roles = self.system.roles(m);
            if roles.is_empty() {
                return false;
            }
            roles.iter().all(|r| match r {
                Role::Origin | Role::Internal | Role::Terminal | Role::InitializeCycle => true,
                Role::Target | Role::Learning => options.show_learning,
                Role::Control | Role::Monitoring => options.show_control,
                Role::Gating => options.show_gating,
            })
        };

        let mut out = String::new();
        let _ = writeln!(out, "digraph {} {{", quote(self.system.name()));
        let _ = writeln!(out, "  rankdir=BT;");
        let _ = writeln!(out, "  node [shape=box];");

        for id in self.system.members() {
            if !layer_visible(id) {
                continue;
            }
            let Ok(m) = model.mechanism(id) else { continue };
            let _ = writeln!(out, "  {} [{}];", quote(m.name()), node_style(self.system.roles(id)));
        }

        for pid in model.projections() {
            let Ok(p) = model.projection(pid) else { continue };
            let (Some(s), Some(r)) = (owner(model, p.sender()), owner(model, p.receiver())) else {
                continue;
            };
            let visible = match p.kind() {
                ProjectionKind::Mapping | ProjectionKind::AutoAssociative => layer_visible(s) && layer_visible(r),
                ProjectionKind::Learning => options.show_learning && layer_visible(s) && layer_visible(r),
                ProjectionKind::Control => options.show_control && layer_visible(s) && layer_visible(r),
                ProjectionKind::Gating => options.show_gating && layer_visible(s) && layer_visible(r),
            };
            if !visible {
                continue;
            }
            let (Ok(sm), Ok(rm)) = (model.mechanism(s), model.mechanism(r)) else {
                continue;
            };
            let style = match p.kind() {
                ProjectionKind::Mapping | ProjectionKind::AutoAssociative => "",
                ProjectionKind::Learning => " [color=orange, style=dashed]",
                ProjectionKind::Control => " [color=blue, style=dashed]",
                ProjectionKind::Gating => " [color=purple, style=dashed]",
            };
            let _ = writeln!(out, "  {} -> {}{};", quote(sm.name()), quote(rm.name()), style);
        }
        out.push_str("}\n");
        out
    }
}

fn owner(model: &Model, state: crate::model::StateId) -> Option<MechanismId> {
    model.owning_mechanism(state).ok().flatten()
}

fn node_style(roles: &[Role]) -> &'static str {
    if roles.contains(&Role::Origin) {
        "color=green, penwidth=2"
    } else if roles.contains(&Role::Terminal) {
        "color=red, penwidth=2"
    } else if roles.contains(&Role::Target) || roles.contains(&Role::Learning) {
        "color=orange"
    } else if roles.contains(&Role::Control) || roles.contains(&Role::Monitoring) {
        "color=blue"
    } else if roles.contains(&Role::Gating) {
        "color=purple"
    } else {
        "color=black"
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::ControlMechanismSpec;
    use crate::composition::{ProcessSpec, SystemConfig};
    use crate::function::SLOPE;
    use crate::mechanism::{MechanismSpec, ModulatoryKeyword};

    fn system() -> System {
        let mut model = Model::new("m");
        let a = model.add_mechanism(MechanismSpec::transfer().named("A")).unwrap();
        let b = model
            .add_mechanism(MechanismSpec::transfer().named("B").with_param(SLOPE, ModulatoryKeyword::Control))
            .unwrap();
        model.add_control_mechanism(ControlMechanismSpec::new().named("Ctl")).unwrap();
        System::new(model, vec![ProcessSpec::new("p", [a, b])], SystemConfig::new("S")).unwrap()
    }

    #[test]
    fn snapshot_reports_roles_and_parameters() {
        let s = system();
        let snap = SystemAdapter::new(&s).snapshot();
        let b = snap.mechanism("B").unwrap();
        assert_eq!(b.roles, vec![Role::Terminal]);
        assert!(b.parameters.iter().any(|(k, _)| k == SLOPE));
        assert_eq!(snap.mechanism("Ctl").unwrap().roles, vec![Role::Control]);
        assert_eq!(snap.deferred_projections, 0);
    }

    #[test]
    fn control_layer_is_optional() {
        let s = system();
        let adapter = SystemAdapter::new(&s);
        let plain = adapter.show_graph(GraphOptions::default());
        assert!(plain.contains("\"A\" -> \"B\";"));
        assert!(!plain.contains("Ctl"));
        let full = adapter.show_graph(GraphOptions::all());
        assert!(full.contains("\"Ctl\" -> \"B\" [color=blue, style=dashed];"));
    }
}
