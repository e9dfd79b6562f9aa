//! Resolution of stage capabilities against the tool registry.
//!
//! Registration is checked when the orchestrator is built; reachability is
//! probed once when a run starts and recorded on the run as a
//! [`CapabilityPlan`]. Later steps, reruns and resumed processes rebuild the
//! same attachment from that plan. Stages never look tools up at call time,
//! they get the resolved [`StageCapabilities`] handed to them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stage::Topology;
use bsj_tools::{Tool, ToolRegistry};
use bsj_types::{BsjError, Result};

/// Tools attached to one stage for the current run.
#[derive(Clone, Default)]
pub struct StageCapabilities {
    pub tools: Vec<Arc<dyn Tool>>,
    /// Optional tools the stage asked for that are missing or unreachable.
    pub degraded: Vec<String>,
}

impl StageCapabilities {
    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.definition().name == name)
    }
}

impl std::fmt::Debug for StageCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.tools.iter().map(|t| t.definition().name).collect();
        f.debug_struct("StageCapabilities")
            .field("tools", &names)
            .field("degraded", &self.degraded)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedCapabilities {
    per_stage: BTreeMap<String, StageCapabilities>,
    /// Degraded tool name -> reason.
    pub degraded: BTreeMap<String, String>,
}

impl ResolvedCapabilities {
    pub fn for_stage(&self, stage: &str) -> StageCapabilities {
        self.per_stage.get(stage).cloned().unwrap_or_default()
    }

    /// The serializable record of this resolution.
    pub fn plan(&self) -> CapabilityPlan {
        CapabilityPlan {
            available: self
                .per_stage
                .values()
                .flat_map(|caps| caps.tools.iter().map(|t| t.definition().name))
                .collect(),
            degraded: self.degraded.clone(),
        }
    }
}

/// Every required capability must be registered. Missing optional ones are
/// fine here and degrade at resolution.
pub fn check_registered(topology: &Topology, registry: &ToolRegistry) -> Result<()> {
    for stage in topology.stages() {
        let Some(spec) = stage.agent_spec() else {
            continue;
        };
        if let Some(missing) = spec
            .capabilities
            .iter()
            .find(|c| c.required && !registry.contains(&c.name))
        {
            return Err(BsjError::ConfigurationError(format!(
                "stage '{}' requires tool '{}', which is not registered",
                stage.name, missing.name
            )));
        }
    }
    Ok(())
}

/// Per-run outcome of capability resolution, kept on the run so later steps
/// (and resumed processes) attach exactly the same tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPlan {
    /// Tools that probed reachable.
    pub available: BTreeSet<String>,
    /// Degraded tool name -> reason.
    pub degraded: BTreeMap<String, String>,
}

type ToolOutcome = std::result::Result<Arc<dyn Tool>, String>;

/// Probe each referenced tool once and attach the reachable ones.
pub async fn resolve(topology: &Topology, registry: &ToolRegistry) -> Result<ResolvedCapabilities> {
    let mut outcomes: BTreeMap<String, ToolOutcome> = BTreeMap::new();
    for stage in topology.stages() {
        let Some(spec) = stage.agent_spec() else {
            continue;
        };
        for requirement in &spec.capabilities {
            if outcomes.contains_key(&requirement.name) {
                continue;
            }
            let outcome = match registry.get(&requirement.name) {
                None => Err("not configured".to_string()),
                Some(tool) => match tool.probe().await {
                    Ok(()) => Ok(tool),
                    Err(e) => Err(e.to_string()),
                },
            };
            if let Err(reason) = &outcome {
                if !requirement.required {
                    tracing::warn!(
                        tool = %requirement.name,
                        reason = %reason,
                        "Optional tool unavailable, stages will run model-only"
                    );
                }
            }
            outcomes.insert(requirement.name.clone(), outcome);
        }
    }
    assemble(topology, &outcomes)
}

/// Rebuild the capabilities recorded in `plan` without probing anything.
/// A tool that has since disappeared from the registry degrades.
pub fn restore(
    topology: &Topology,
    registry: &ToolRegistry,
    plan: &CapabilityPlan,
) -> Result<ResolvedCapabilities> {
    let mut outcomes: BTreeMap<String, ToolOutcome> = plan
        .degraded
        .iter()
        .map(|(name, reason)| (name.clone(), Err(reason.clone())))
        .collect();
    for name in &plan.available {
        let outcome = registry
            .get(name)
            .ok_or_else(|| "not configured".to_string());
        outcomes.insert(name.clone(), outcome);
    }
    assemble(topology, &outcomes)
}

fn assemble(topology: &Topology, outcomes: &BTreeMap<String, ToolOutcome>) -> Result<ResolvedCapabilities> {
    let mut resolved = ResolvedCapabilities::default();
    for stage in topology.stages() {
        let Some(spec) = stage.agent_spec() else {
            continue;
        };
        let mut caps = StageCapabilities::default();
        for requirement in &spec.capabilities {
            let outcome = outcomes
                .get(&requirement.name)
                .cloned()
                .unwrap_or_else(|| Err("not resolved".to_string()));
            match outcome {
                Ok(tool) => caps.tools.push(tool),
                Err(reason) if requirement.required => {
                    return Err(BsjError::ProviderUnavailable {
                        provider: requirement.name.clone(),
                        status: None,
                        message: reason,
                    });
                }
                Err(reason) => {
                    resolved.degraded.entry(requirement.name.clone()).or_insert(reason);
                    caps.degraded.push(requirement.name.clone());
                }
            }
        }
        resolved.per_stage.insert(stage.name.clone(), caps);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageDescriptor, Step};
    use async_trait::async_trait;
    use bsj_llm::ToolDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeTool {
        name: &'static str,
        up: bool,
        probes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.to_string(),
                description: "probe".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.up {
                Ok(())
            } else {
                Err(BsjError::ToolUnavailable {
                    tool: self.name.to_string(),
                    message: "connection refused".to_string(),
                })
            }
        }

        async fn execute(&self, _arguments: serde_json::Value) -> Result<String> {
            Ok(String::new())
        }
    }

    fn topology(required_fetch: bool) -> Topology {
        let researcher = StageDescriptor::agent("researcher", "r")
            .reads(["topic"])
            .writes(["research"])
            .optional_tool("web_search");
        let researcher = if required_fetch {
            researcher.requires_tool("fetch_url")
        } else {
            researcher.optional_tool("fetch_url")
        };
        Topology::new(
            "t",
            vec!["topic".into()],
            vec![
                Step::Single(researcher),
                Step::Single(
                    StageDescriptor::agent("scriptwriter", "s")
                        .reads(["research"])
                        .writes(["script"])
                        .optional_tool("fetch_url"),
                ),
            ],
        )
    }

    fn registry(fetch_up: bool, probes: &Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(ProbeTool {
            name: "web_search",
            up: true,
            probes: probes.clone(),
        });
        registry.register(ProbeTool {
            name: "fetch_url",
            up: fetch_up,
            probes: probes.clone(),
        });
        registry
    }

    #[test]
    fn missing_required_tool_is_configuration_error() {
        let err = check_registered(&topology(true), &ToolRegistry::new()).unwrap_err();
        assert!(matches!(err, BsjError::ConfigurationError(_)));
        assert!(check_registered(&topology(false), &ToolRegistry::new()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_optional_tool_degrades() {
        let probes = Arc::new(AtomicUsize::new(0));
        let resolved = resolve(&topology(false), &registry(false, &probes))
            .await
            .unwrap();

        let researcher = resolved.for_stage("researcher");
        assert_eq!(researcher.tools.len(), 1);
        assert!(researcher.find("web_search").is_some());
        assert_eq!(researcher.degraded, vec!["fetch_url".to_string()]);
        assert!(resolved.degraded.contains_key("fetch_url"));
        // Each tool is probed once even though two stages reference fetch_url.
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregistered_optional_tool_degrades() {
        let probes = Arc::new(AtomicUsize::new(0));
        let resolved = resolve(&topology(false), &ToolRegistry::new()).await.unwrap();
        assert!(resolved.for_stage("researcher").tools.is_empty());
        assert_eq!(resolved.degraded["web_search"], "not configured");
        assert_eq!(probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restored_plan_skips_probes() {
        let probes = Arc::new(AtomicUsize::new(0));
        let topology = topology(false);
        let resolved = resolve(&topology, &registry(false, &probes)).await.unwrap();
        let plan = resolved.plan();
        assert_eq!(plan.available, BTreeSet::from(["web_search".to_string()]));
        assert!(plan.degraded.contains_key("fetch_url"));
        assert_eq!(probes.load(Ordering::SeqCst), 2);

        // fetch_url is reachable again, but the run keeps what it started with.
        let restored = restore(&topology, &registry(true, &probes), &plan).unwrap();
        assert_eq!(probes.load(Ordering::SeqCst), 2);
        let researcher = restored.for_stage("researcher");
        assert_eq!(researcher.tools.len(), 1);
        assert!(researcher.find("fetch_url").is_none());
        assert_eq!(researcher.degraded, vec!["fetch_url".to_string()]);
        assert_eq!(restored.plan(), plan);
    }

    #[test]
    fn restored_plan_degrades_vanished_tool() {
        let plan = CapabilityPlan {
            available: BTreeSet::from(["web_search".to_string(), "fetch_url".to_string()]),
            degraded: BTreeMap::new(),
        };
        let restored = restore(&topology(false), &ToolRegistry::new(), &plan).unwrap();
        assert!(restored.for_stage("researcher").tools.is_empty());
        assert_eq!(restored.degraded["fetch_url"], "not configured");
    }

    #[tokio::test]
    async fn unreachable_required_tool_is_provider_error() {
        let probes = Arc::new(AtomicUsize::new(0));
        let err = resolve(&topology(true), &registry(false, &probes))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BsjError::ProviderUnavailable { ref provider, .. } if provider == "fetch_url"));
    }
}
