//! MMD 模型实例
//!
//! `ModelDescriptor` 收集加载器解析好的全部输入，`MmdModel` 负责每帧的阶段调度。

mod mmd_model;

pub use mmd_model::MmdModel;

use crate::morph::{MaterialProxy, RuntimeMorph};
use crate::physics::{JointDescriptor, RigidBodyDescriptor};
use crate::skeleton::BoneMetadata;

/// 单个模型实例的输入数据
#[derive(Default)]
pub struct ModelDescriptor {
    pub name: String,
    pub bones: Vec<BoneMetadata>,
    pub morphs: Vec<RuntimeMorph>,
    /// 材质代理，索引与材质 Morph 元素中的材质索引一致
    pub materials: Vec<Box<dyn MaterialProxy>>,
    pub rigid_bodies: Vec<RigidBodyDescriptor>,
    pub joints: Vec<JointDescriptor>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, bones: Vec<BoneMetadata>) -> Self {
        Self {
            name: name.into(),
            bones,
            ..Default::default()
        }
    }

    pub fn with_morphs(mut self, morphs: Vec<RuntimeMorph>) -> Self {
        self.morphs = morphs;
        self
    }

    pub fn with_materials(mut self, materials: Vec<Box<dyn MaterialProxy>>) -> Self {
        self.materials = materials;
        self
    }

    pub fn with_physics(mut self, rigid_bodies: Vec<RigidBodyDescriptor>, joints: Vec<JointDescriptor>) -> Self {
        self.rigid_bodies = rigid_bodies;
        self.joints = joints;
        self
    }
}
