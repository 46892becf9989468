//! Morph 系统
//!
//! - RuntimeMorph: 组 / 骨骼 / 材质 / 顶点 / UV Morph 的运行时数据
//! - MaterialProxy: 材质系统需要实现的可变通道接口
//! - MorphController: 权重管理与每帧混合

mod controller;
mod material_proxy;

pub use controller::MorphController;
pub use material_proxy::{MaterialChannels, MaterialProxy, StandardMaterialProxy};

use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::{Quat, Vec3, Vec4};

use crate::{MmdError, Result};

// ============================================================================
// 外部变形目标
// ============================================================================

/// 顶点 / UV Morph 委托给外部变形系统的目标
///
/// Morph 控制器只写入影响度，实际的顶点变形由外部系统完成。
pub trait MorphTarget: Send + Sync + fmt::Debug {
    fn influence(&self) -> f32;
    fn set_influence(&self, influence: f32);
}

/// 以原子变量保存影响度的变形目标
#[derive(Debug, Default)]
pub struct AtomicMorphTarget {
    bits: AtomicU32,
}

impl AtomicMorphTarget {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MorphTarget for AtomicMorphTarget {
    #[inline]
    fn influence(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    fn set_influence(&self, influence: f32) {
        self.bits.store(influence.to_bits(), Ordering::Release);
    }
}

// ============================================================================
// 材质 Morph
// ============================================================================

/// 材质 Morph 混合方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialBlendMode {
    /// v = v + (v * delta - v) * weight
    Multiply,
    /// v = v + delta * weight
    Add,
}

/// 材质 Morph 元素
///
/// 通道为 `None` 表示该通道是恒等值（乘算为 1，加算为 0），应用时跳过。
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialMorphElement {
    /// 目标材质索引，-1 表示所有材质
    pub material_index: i32,
    pub blend_mode: MaterialBlendMode,
    pub diffuse: Option<Vec4>,
    pub specular: Option<Vec3>,
    pub shininess: Option<f32>,
    pub ambient: Option<Vec3>,
    pub edge_color: Option<Vec4>,
    pub edge_size: Option<f32>,
    pub texture_color: Option<Vec4>,
    pub sphere_texture_color: Option<Vec4>,
    pub toon_texture_color: Option<Vec4>,
}

impl MaterialMorphElement {
    /// 从完整的通道数据创建，恒等通道被省略
    pub fn new(material_index: i32, blend_mode: MaterialBlendMode, delta: &MaterialChannels) -> Self {
        let identity = match blend_mode {
            MaterialBlendMode::Multiply => 1.0,
            MaterialBlendMode::Add => 0.0,
        };
        let v4 = |v: Vec4| (v != Vec4::splat(identity)).then_some(v);
        let v3 = |v: Vec3| (v != Vec3::splat(identity)).then_some(v);
        let f = |v: f32| (v != identity).then_some(v);

        Self {
            material_index,
            blend_mode,
            diffuse: v4(delta.diffuse),
            specular: v3(delta.specular),
            shininess: f(delta.shininess),
            ambient: v3(delta.ambient),
            edge_color: v4(delta.edge_color),
            edge_size: f(delta.edge_size),
            texture_color: v4(delta.texture_color),
            sphere_texture_color: v4(delta.sphere_texture_color),
            toon_texture_color: v4(delta.toon_texture_color),
        }
    }

    /// 将该元素按权重应用到材质通道
    pub fn apply(&self, channels: &mut MaterialChannels, weight: f32) {
        let mode = self.blend_mode;
        blend(&mut channels.diffuse, self.diffuse, mode, weight);
        blend(&mut channels.specular, self.specular, mode, weight);
        blend(&mut channels.shininess, self.shininess, mode, weight);
        blend(&mut channels.ambient, self.ambient, mode, weight);
        blend(&mut channels.edge_color, self.edge_color, mode, weight);
        blend(&mut channels.edge_size, self.edge_size, mode, weight);
        blend(&mut channels.texture_color, self.texture_color, mode, weight);
        blend(&mut channels.sphere_texture_color, self.sphere_texture_color, mode, weight);
        blend(&mut channels.toon_texture_color, self.toon_texture_color, mode, weight);
    }
}

fn blend<T>(value: &mut T, delta: Option<T>, mode: MaterialBlendMode, weight: f32)
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Mul<f32, Output = T>,
{
    let Some(delta) = delta else {
        return;
    };
    *value = match mode {
        MaterialBlendMode::Multiply => *value + (*value * delta - *value) * weight,
        MaterialBlendMode::Add => *value + delta * weight,
    };
}

// ============================================================================
// 运行时 Morph
// ============================================================================

/// Morph 类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MorphType {
    Group,
    Bone,
    Material,
    Vertex,
    /// UV 及追加 UV（通道 0 为基本 UV）
    Uv(u8),
}

/// Morph 数据
#[derive(Clone, Debug)]
pub enum MorphData {
    /// 子 Morph 索引与比率，索引 -1 表示无贡献
    Group { indices: Vec<i32>, ratios: Vec<f32> },
    /// 骨骼索引、平移增量、旋转增量
    Bone { indices: Vec<i32>, positions: Vec<Vec3>, rotations: Vec<Quat> },
    Material(Vec<MaterialMorphElement>),
    Vertex(Vec<Arc<dyn MorphTarget>>),
    Uv { channel: u8, targets: Vec<Arc<dyn MorphTarget>> },
}

/// 运行时 Morph
#[derive(Clone, Debug)]
pub struct RuntimeMorph {
    pub name: String,
    pub data: MorphData,
}

impl RuntimeMorph {
    pub fn group(name: impl Into<String>, indices: Vec<i32>, ratios: Vec<f32>) -> Self {
        Self { name: name.into(), data: MorphData::Group { indices, ratios } }
    }

    pub fn bone(
        name: impl Into<String>,
        indices: Vec<i32>,
        positions: Vec<Vec3>,
        rotations: Vec<Quat>,
    ) -> Self {
        Self { name: name.into(), data: MorphData::Bone { indices, positions, rotations } }
    }

    pub fn material(name: impl Into<String>, elements: Vec<MaterialMorphElement>) -> Self {
        Self { name: name.into(), data: MorphData::Material(elements) }
    }

    pub fn vertex(name: impl Into<String>, targets: Vec<Arc<dyn MorphTarget>>) -> Self {
        Self { name: name.into(), data: MorphData::Vertex(targets) }
    }

    pub fn uv(name: impl Into<String>, channel: u8, targets: Vec<Arc<dyn MorphTarget>>) -> Self {
        Self { name: name.into(), data: MorphData::Uv { channel, targets } }
    }

    pub fn morph_type(&self) -> MorphType {
        match &self.data {
            MorphData::Group { .. } => MorphType::Group,
            MorphData::Bone { .. } => MorphType::Bone,
            MorphData::Material(_) => MorphType::Material,
            MorphData::Vertex(_) => MorphType::Vertex,
            MorphData::Uv { channel, .. } => MorphType::Uv(*channel),
        }
    }

    /// 校验并行数组长度
    pub fn validate(&self) -> Result<()> {
        let mismatch = |what: &str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(MmdError::ArrayLengthMismatch {
                    what: format!("morph '{}' {}", self.name, what),
                    expected,
                    actual,
                })
            }
        };
        match &self.data {
            MorphData::Group { indices, ratios } => mismatch("ratios", indices.len(), ratios.len()),
            MorphData::Bone { indices, positions, rotations } => {
                mismatch("positions", indices.len(), positions.len())?;
                mismatch("rotations", indices.len(), rotations.len())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_channels_are_omitted() {
        let mut delta = MaterialChannels::multiply_identity();
        delta.diffuse = Vec4::splat(2.0);
        let element = MaterialMorphElement::new(0, MaterialBlendMode::Multiply, &delta);
        assert_eq!(element.diffuse, Some(Vec4::splat(2.0)));
        assert!(element.specular.is_none());
        assert!(element.edge_size.is_none());

        let element = MaterialMorphElement::new(0, MaterialBlendMode::Add, &MaterialChannels::add_identity());
        assert!(element.diffuse.is_none());
        assert!(element.toon_texture_color.is_none());
    }

    #[test]
    fn test_multiply_blend() {
        let mut delta = MaterialChannels::multiply_identity();
        delta.diffuse = Vec4::splat(2.0);
        let element = MaterialMorphElement::new(0, MaterialBlendMode::Multiply, &delta);

        let mut channels = MaterialChannels::default();
        channels.diffuse = Vec4::ONE;
        element.apply(&mut channels, 0.5);
        assert!(channels.diffuse.abs_diff_eq(Vec4::splat(1.5), 1e-6));
    }

    #[test]
    fn test_add_blend() {
        let mut delta = MaterialChannels::add_identity();
        delta.diffuse = Vec4::new(0.2, 0.0, 0.0, 0.0);
        let element = MaterialMorphElement::new(0, MaterialBlendMode::Add, &delta);

        let mut channels = MaterialChannels::default();
        channels.diffuse = Vec4::ONE;
        element.apply(&mut channels, 1.0);
        assert!(channels.diffuse.abs_diff_eq(Vec4::new(1.2, 1.0, 1.0, 1.0), 1e-6));
    }

    #[test]
    fn test_validate_rejects_desynchronized_arrays() {
        let morph = RuntimeMorph::bone("笑い", vec![0, 1], vec![Vec3::ZERO], vec![Quat::IDENTITY; 2]);
        assert!(matches!(
            morph.validate(),
            Err(MmdError::ArrayLengthMismatch { expected: 2, actual: 1, .. })
        ));
        let morph = RuntimeMorph::group("まばたき", vec![0], vec![1.0]);
        assert!(morph.validate().is_ok());
    }

    #[test]
    fn test_atomic_morph_target_roundtrip() {
        let target = AtomicMorphTarget::new();
        assert_eq!(target.influence(), 0.0);
        target.set_influence(0.75);
        assert_eq!(target.influence(), 0.75);
    }
}
