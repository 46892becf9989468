//! MMD Runtime - Rust 实现的 MMD 骨骼动画运行时
//!
//! 每帧计算所有骨骼的世界变换、Morph 权重混合，并与外部刚体物理保持同步：
//! - 骨骼层次与按 transform order 排序的两阶段更新
//! - 附加变换（付与）求解与 CCD IK 求解
//! - Morph 控制器（骨骼 / 材质 / 组 / 顶点 / UV）
//! - 物理同步桥接（附带 Rapier 后端）
//! - 双缓冲并发求值流水线

pub mod animation;
pub mod model;
pub mod morph;
pub mod physics;
pub mod runtime;
pub mod skeleton;

pub use animation::{KeyframeAnimation, ModelAnimation};
pub use model::{MmdModel, ModelDescriptor};
pub use morph::{MaterialProxy, MorphController, RuntimeMorph, StandardMaterialProxy};
pub use physics::{PhysicsEngine, PhysicsModel, RapierPhysicsEngine};
pub use runtime::{AnimationPlayer, EvaluationType, MmdRuntime, ModelId, RuntimeConfig, Spinlock};
pub use skeleton::{BoneMetadata, BoneSet, IkSolver, RuntimeBone};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmdError {
    #[error("Array length mismatch in {what}: expected {expected}, got {actual}")]
    ArrayLengthMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid morph index: {0}")]
    InvalidMorphIndex(usize),

    #[error("Invalid model id: {0}")]
    InvalidModelId(usize),

    #[error("Physics error: {0}")]
    Physics(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, MmdError>;
