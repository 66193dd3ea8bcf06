use sponge_core::{CapacityMode, ModuleDescriptor, ModuleKind};
use sponge_engine::ModuleGraph;

use super::Context;

pub fn validate(ctx: &Context, format: &str) -> anyhow::Result<()> {
    let composition = ctx.composition()?;
    let graph = ModuleGraph::from_composition(&composition)?;

    if format == "json" {
        let modules: Vec<_> = composition
            .modules
            .iter()
            .map(|m| {
                serde_json::json!({
                    "module": m.kind,
                    "depends_on": m.depends_on,
                    "wave": wave_of(&graph, m.kind),
                    "fingerprint": m.descriptor.fingerprint(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&modules)?);
        return Ok(());
    }

    println!(
        "✓ Environment '{}' in {} is valid",
        composition.environment, composition.region
    );
    println!();
    println!("Modules:");
    for module in &composition.modules {
        let deps: Vec<&str> = module.depends_on.iter().map(|d| d.as_str()).collect();
        if deps.is_empty() {
            println!("  {}", module.kind);
        } else {
            println!("  {} (after {})", module.kind, deps.join(", "));
        }
    }

    println!();
    println!("Apply waves:");
    for (index, wave) in graph.waves().iter().enumerate() {
        let kinds: Vec<&str> = wave.iter().map(ModuleKind::as_str).collect();
        println!("  {}. {}", index + 1, kinds.join(", "));
    }

    if let Some(network) = composition.network() {
        println!();
        println!("Subnets in {}:", network.address_block);
        for zone in &network.zones {
            println!(
                "  {:<14} public {:<16} private {}",
                zone.zone, zone.public.to_string(), zone.private
            );
        }
    }

    if let Some(cluster) = composition.cluster() {
        println!();
        println!("Node groups (Kubernetes {}):", cluster.version);
        for group in &cluster.node_groups {
            let capacity = match group.capacity {
                CapacityMode::OnDemand => "on-demand",
                CapacityMode::Spot => "spot",
            };
            println!(
                "  {:<10} {:<12} {:<9} {}/{}/{}",
                group.name,
                group.instance_type,
                capacity,
                group.scaling.min,
                group.scaling.desired,
                group.scaling.max
            );
        }
    }

    for module in &composition.modules {
        if let ModuleDescriptor::RelationalStore(store) = &module.descriptor {
            println!();
            println!(
                "Store: {} {} on {}, {} GB, {}",
                store.engine,
                store.engine_version,
                store.instance_class,
                store.storage_gb,
                if store.is_multi_az() { "multi-AZ" } else { "single-AZ" }
            );
        }
    }

    Ok(())
}

/// Zero-based wave a module is applied in.
fn wave_of(graph: &ModuleGraph, kind: ModuleKind) -> Option<usize> {
    graph.waves().iter().position(|wave| wave.contains(&kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffolded_environment_validates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            state: dir.path().join("state.redb"),
            config: dir.path().join("sponge.toml"),
        };
        super::super::init::init(&ctx, "dev", "us-east-1", false).unwrap();

        validate(&ctx, "text").unwrap();
        validate(&ctx, "json").unwrap();
    }

    #[test]
    fn waves_place_dependents_after_dependencies() {
        let composition =
            sponge_core::compose(&sponge_core::EnvironmentParams::scaffold("dev", "us-east-1"))
                .unwrap();
        let graph = ModuleGraph::from_composition(&composition).unwrap();
        assert_eq!(wave_of(&graph, ModuleKind::Network), Some(0));
        assert_eq!(wave_of(&graph, ModuleKind::Registries), Some(0));
        assert_eq!(wave_of(&graph, ModuleKind::Cache), Some(1));
        assert_eq!(wave_of(&graph, ModuleKind::ClusterAddons), Some(3));
    }
}
