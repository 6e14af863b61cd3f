use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::Vec3;
use vse_core::{Aabb, HandleMap, Material, MaterialId, Mesh, MeshId, Transform};
use vse_scene::{Camera, DrawResolver, ResolvedDraw, SceneGraph, SceneView};

struct Uniform {
    materials: Vec<MaterialId>,
}

impl DrawResolver for Uniform {
    fn resolve(&self, _mesh: MeshId, material: Option<MaterialId>) -> Option<ResolvedDraw> {
        let material = material.unwrap_or(self.materials[0]);
        let key = self.materials.iter().position(|&m| m == material)? as u64;
        Some(ResolvedDraw {
            material,
            pipeline: key % 2,
            descriptor: key,
            bounds: Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)),
        })
    }
}

/// A grid of `side * side` parents with four children each.
fn grid(side: u32) -> (SceneGraph, Uniform) {
    let mut meshes: HandleMap<(), Mesh> = HandleMap::new();
    let mut materials: HandleMap<(), Material> = HandleMap::new();
    let mesh = meshes.insert(());
    let materials: Vec<MaterialId> = (0..4).map(|_| materials.insert(())).collect();

    let mut graph = SceneGraph::new();
    for x in 0..side {
        for z in 0..side {
            let at = Vec3::new(x as f32 * 2.0, 0.0, -(z as f32) * 2.0);
            let parent = graph
                .add_entity(None, Transform::from_translation(at), Some(mesh), None)
                .unwrap();
            for (i, &material) in materials.iter().enumerate() {
                let offset = Vec3::new(0.0, 1.0 + i as f32, 0.0);
                graph
                    .add_entity(
                        Some(parent),
                        Transform::from_translation(offset),
                        Some(mesh),
                        Some(material),
                    )
                    .unwrap();
            }
        }
    }
    (graph, Uniform { materials })
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("scene_view_build");
    for side in [16u32, 64] {
        let (mut graph, resolver) = grid(side);
        let mut camera = Camera {
            position: Vec3::new(side as f32, 20.0, 10.0),
            far: 1000.0,
            ..Camera::default()
        };
        camera.look_at(Vec3::new(side as f32, 0.0, -(side as f32)));
        let frustum = camera.frustum();

        group.bench_with_input(BenchmarkId::new("culled", side), &side, |b, _| {
            b.iter(|| black_box(SceneView::build(&mut graph, Some(&frustum), &resolver).len()));
        });
        group.bench_with_input(BenchmarkId::new("unculled", side), &side, |b, _| {
            b.iter(|| black_box(SceneView::build(&mut graph, None, &resolver).len()));
        });
    }
    group.finish();
}

fn bench_dirty_roots(c: &mut Criterion) {
    let (mut graph, _) = grid(64);
    let roots = graph.roots().to_vec();
    let mut step = 0.0f32;
    c.bench_function("move_every_root", |b| {
        b.iter(|| {
            step += 0.01;
            for &root in &roots {
                graph
                    .set_transform(root, Transform::from_translation(Vec3::splat(step)))
                    .unwrap();
            }
            graph.update_world_transforms();
        });
    });
}

criterion_group!(benches, bench_build, bench_dirty_roots);
criterion_main!(benches);
