//! Binding layout extraction from SPIR-V.
//!
//! The module is parsed back with naga's SPIR-V frontend, so layouts always
//! describe the binary that will actually be bound.

use crate::error::ReflectError;
use naga::{AddressSpace, ArraySize, Binding, ImageClass, Module, Scalar, ScalarKind, TypeInner, VectorSize};
use vse_gpu::{
    BindingKind, BindingLayout, DescriptorBinding, IntermediateBinary, PushConstantRange,
    ShaderStage, VertexFormat, VertexInput,
};

/// Reflect descriptor bindings, push constants and vertex inputs of `binary`.
pub fn reflect(binary: &IntermediateBinary) -> Result<BindingLayout, ReflectError> {
    let options = naga::front::spv::Options {
        adjust_coordinate_space: false,
        ..Default::default()
    };
    let module = naga::front::spv::parse_u8_slice(binary.as_bytes(), &options)
        .map_err(|e| ReflectError::Parse(e.to_string()))?;

    let mut layouter = naga::proc::Layouter::default();
    layouter
        .update(module.to_ctx())
        .map_err(|e| ReflectError::Layout(e.to_string()))?;

    let stages = binary.stage.flag();
    let mut layout = BindingLayout::default();

    for (_, var) in module.global_variables.iter() {
        if var.space == AddressSpace::PushConstant {
            layout.push_constants.push(PushConstantRange {
                offset: 0,
                size: layouter[var.ty].size,
                stages,
            });
            continue;
        }
        let Some(slot) = &var.binding else {
            continue;
        };
        let (kind, count) =
            binding_kind(&module, var.ty, var.space).ok_or(ReflectError::UnsupportedBinding {
                set: slot.group,
                binding: slot.binding,
            })?;
        layout.bindings.push(DescriptorBinding {
            set: slot.group,
            binding: slot.binding,
            kind,
            count,
            stages,
        });
    }
    layout.bindings.sort_by_key(|b| (b.set, b.binding));

    if binary.stage == ShaderStage::Vertex {
        if let Some(entry) = module
            .entry_points
            .iter()
            .find(|ep| ep.stage == naga::ShaderStage::Vertex && ep.name == binary.entry_point)
        {
            for argument in &entry.function.arguments {
                collect_inputs(&module, argument.ty, argument.binding.as_ref(), &mut layout.vertex_inputs)?;
            }
        }
        layout.vertex_inputs.sort_by_key(|i| i.location);
    }

    Ok(layout)
}

fn binding_kind(module: &Module, ty: naga::Handle<naga::Type>, space: AddressSpace) -> Option<(BindingKind, u32)> {
    match space {
        AddressSpace::Uniform => Some((BindingKind::UniformBuffer, 1)),
        AddressSpace::Storage { .. } => Some((BindingKind::StorageBuffer, 1)),
        AddressSpace::Handle => match &module.types[ty].inner {
            TypeInner::BindingArray { base, size } => {
                let count = match size {
                    ArraySize::Constant(n) => n.get(),
                    // Runtime-sized; the pipeline layout picks the count
                    ArraySize::Dynamic => 0,
                };
                handle_kind(&module.types[*base].inner).map(|kind| (kind, count))
            }
            inner => handle_kind(inner).map(|kind| (kind, 1)),
        },
        _ => None,
    }
}

const fn handle_kind(inner: &TypeInner) -> Option<BindingKind> {
    match inner {
        TypeInner::Image {
            class: ImageClass::Storage { .. },
            ..
        } => Some(BindingKind::StorageImage),
        TypeInner::Image { .. } => Some(BindingKind::SampledImage),
        TypeInner::Sampler { .. } => Some(BindingKind::Sampler),
        _ => None,
    }
}

fn collect_inputs(
    module: &Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&Binding>,
    out: &mut Vec<VertexInput>,
) -> Result<(), ReflectError> {
    match binding {
        Some(Binding::Location { location, .. }) => {
            let format = vertex_format(&module.types[ty].inner)
                .ok_or(ReflectError::UnsupportedInput(*location))?;
            out.push(VertexInput {
                location: *location,
                format,
            });
        }
        Some(Binding::BuiltIn(_)) => {}
        None => {
            if let TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    collect_inputs(module, member.ty, member.binding.as_ref(), out)?;
                }
            }
        }
    }
    Ok(())
}

const fn vertex_format(inner: &TypeInner) -> Option<VertexFormat> {
    match *inner {
        TypeInner::Scalar(Scalar { kind, width: 4 }) => match kind {
            ScalarKind::Float => Some(VertexFormat::Float32),
            ScalarKind::Uint => Some(VertexFormat::Uint32),
            ScalarKind::Sint => Some(VertexFormat::Sint32),
            _ => None,
        },
        TypeInner::Vector {
            size,
            scalar: Scalar {
                kind: ScalarKind::Float,
                width: 4,
            },
        } => Some(match size {
            VectorSize::Bi => VertexFormat::Float32x2,
            VectorSize::Tri => VertexFormat::Float32x3,
            VectorSize::Quad => VertexFormat::Float32x4,
        }),
        TypeInner::Vector {
            size: VectorSize::Quad,
            scalar: Scalar {
                kind: ScalarKind::Uint,
                width: 4,
            },
        } => Some(VertexFormat::Uint32x4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::compiler::{Defines, NagaCompiler, ShaderCompiler};

    fn compile(source: &crate::ShaderSource, stage: ShaderStage) -> IntermediateBinary {
        NagaCompiler.compile(source, stage, &Defines::new()).unwrap()
    }

    #[test]
    fn mesh_vertex_layout() {
        let binary = compile(&builtin::mesh_vertex(), ShaderStage::Vertex);
        let layout = reflect(&binary).unwrap();

        assert_eq!(
            layout.vertex_inputs,
            vec![
                VertexInput {
                    location: 0,
                    format: VertexFormat::Float32x3
                },
                VertexInput {
                    location: 1,
                    format: VertexFormat::Float32x3
                },
                VertexInput {
                    location: 2,
                    format: VertexFormat::Float32x2
                },
            ]
        );
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].kind, BindingKind::UniformBuffer);
        assert_eq!((layout.bindings[0].set, layout.bindings[0].binding), (0, 0));
        assert_eq!(layout.push_constants.len(), 1);
        assert_eq!(layout.push_constants[0].size, 64);
        assert_eq!(layout.push_constants[0].stages, vse_gpu::ShaderStages::VERTEX);
    }

    #[test]
    fn mesh_fragment_material_set() {
        let binary = compile(&builtin::mesh_fragment(), ShaderStage::Fragment);
        let layout = reflect(&binary).unwrap();

        let material = layout.set_layout(1);
        let kinds: Vec<_> = material.bindings.iter().map(|b| (b.binding, b.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, BindingKind::UniformBuffer),
                (1, BindingKind::SampledImage),
                (2, BindingKind::Sampler),
            ]
        );
        assert!(layout.vertex_inputs.is_empty());
        assert!(layout.push_constants.is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let binary = IntermediateBinary::new(ShaderStage::Vertex, "main", vec![0xdead_beef; 8]);
        assert!(matches!(reflect(&binary), Err(ReflectError::Parse(_))));
    }
}
