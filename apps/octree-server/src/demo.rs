//! Random scene used when the server runs without an external data source.

use std::time::Duration;

use glam::Vec3;
use octree_stream::{ElementId, MemoryOctree, SharedTree};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DemoScene {
    pub elements: u64,
    pub half_extent: f32,
    pub mutations_per_tick: u32,
    pub tick: Duration,
    pub seed: Option<u64>,
}

impl DemoScene {
    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub fn populate(&self, tree: &mut MemoryOctree) {
        let mut rng = self.rng();
        for id in 0..self.elements {
            let center = Vec3::new(
                rng.gen_range(-self.half_extent..self.half_extent),
                rng.gen_range(-self.half_extent..self.half_extent),
                rng.gen_range(-self.half_extent..self.half_extent),
            );
            let radius = rng.gen_range(0.25..4.0);
            tree.insert(id, center, radius, properties(id, 0, &mut rng));
        }
    }

    /// Rewrites a few random elements every tick so viewers keep receiving
    /// incremental updates.
    pub fn spawn_mutator(&self, tree: SharedTree<MemoryOctree>) -> Option<JoinHandle<()>> {
        if self.elements == 0 || self.mutations_per_tick == 0 {
            return None;
        }
        let scene = *self;
        Some(tokio::spawn(async move {
            let mut rng = scene.rng();
            let mut interval = tokio::time::interval(scene.tick);
            let mut generation = 0u64;
            loop {
                interval.tick().await;
                generation += 1;
                {
                    let mut tree = tree.write();
                    for _ in 0..scene.mutations_per_tick {
                        let id: ElementId = rng.gen_range(0..scene.elements);
                        tree.update_properties(id, properties(id, generation, &mut rng));
                    }
                }
                debug!(target = "octree_server::demo", generation, "scene mutated");
            }
        }))
    }
}

fn properties(id: ElementId, generation: u64, rng: &mut StdRng) -> Map<String, Value> {
    let kind = ["box", "sphere", "light", "zone"][rng.gen_range(0..4)];
    let mut map = Map::new();
    map.insert("name".into(), json!(format!("{kind}-{id}")));
    map.insert("kind".into(), json!(kind));
    map.insert(
        "color".into(),
        json!([rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()]),
    );
    map.insert("generation".into(), json!(generation));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_scene_is_reproducible() {
        let scene = DemoScene {
            elements: 50,
            half_extent: 64.0,
            mutations_per_tick: 0,
            tick: Duration::from_secs(1),
            seed: Some(7),
        };
        let mut first = MemoryOctree::new(Vec3::ZERO, 128.0);
        let mut second = MemoryOctree::new(Vec3::ZERO, 128.0);
        scene.populate(&mut first);
        scene.populate(&mut second);
        assert_eq!(first.len(), 50);
        assert_eq!(first.properties(17), second.properties(17));
        assert!(scene.spawn_mutator(first.shared()).is_none());
    }
}
