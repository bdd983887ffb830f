use super::{ModuleInfo, OrderEntry};
use crate::error::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

/// Fails with `CyclicOrder` when meta modules reach themselves through their
/// orders. A ref without a version points at every known version of its id;
/// refs to unknown modules are ignored here.
pub fn check_order_cycles<'a, I>(modules: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a ModuleInfo, &'a [OrderEntry])>,
{
    let nodes: Vec<(&ModuleInfo, String, &[OrderEntry])> = modules
        .into_iter()
        .map(|(info, order)| (info, info.full_name(), order))
        .collect();

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (_, name, _) in &nodes {
        graph.add_node(name.as_str());
    }
    for (_, name, order) in &nodes {
        for module_ref in order.iter().flat_map(|entry| &entry.group) {
            let targets = nodes.iter().filter(|(info, _, _)| {
                info.id == module_ref.id
                    && (module_ref.version.is_empty() || info.version == module_ref.version)
            });
            for (_, target, _) in targets {
                graph.add_edge(name.as_str(), target.as_str(), ());
            }
        }
    }

    let mut cycles: Vec<Vec<&str>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort_unstable();
            scc
        })
        .collect();
    cycles.sort();

    match cycles.first() {
        None => Ok(()),
        Some(scc) => {
            let module = scc[0];
            let through = graph
                .neighbors(module)
                .filter(|n| scc.contains(n))
                .min()
                .unwrap_or(module);
            Err(Error::CyclicOrder {
                module: module.to_string(),
                through: through.to_string(),
            })
        }
    }
}
