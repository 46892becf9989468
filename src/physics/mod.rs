//! 物理系统
//!
//! 核心只依赖 `PhysicsEngine` / `PhysicsModel` 两个接口：
//! 构建 → 每帧 [sync_bodies → step → sync_bones]，播放开始或跳转时 initialize。
//! `RapierPhysicsEngine` 是基于 rapier3d 的默认实现。

pub mod config;
mod bridge;
mod rapier_physics;

pub use bridge::RigidBodyBinding;
pub use config::{get_config, reset_config, set_config, PhysicsConfig};
pub use rapier_physics::{RapierPhysicsEngine, RapierPhysicsModel};

use glam::{Quat, Vec3};

use crate::skeleton::BoneSet;
use crate::Result;

// ============================================================================
// 刚体 / 关节描述
// ============================================================================

/// 刚体物理模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PhysicsMode {
    /// 跟随骨骼（运动学）
    #[default]
    Kinematic,
    /// 物理驱动骨骼
    Dynamic,
    /// 物理驱动骨骼旋转，位置保持骨骼的动画位置
    DynamicWithBoneAlign,
}

/// 碰撞形状
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RigidBodyShape {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
    /// 沿 Y 轴的胶囊，height 为两端球心之间的距离
    Capsule { radius: f32, height: f32 },
}

/// 刚体描述
#[derive(Clone, Debug, PartialEq)]
pub struct RigidBodyDescriptor {
    pub name: String,
    /// 关联骨骼索引，-1 表示不关联
    pub bone_index: i32,
    pub shape: RigidBodyShape,
    /// 模型空间初始位置
    pub position: Vec3,
    /// 模型空间初始旋转
    pub rotation: Quat,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub friction: f32,
    /// 反弹系数
    pub repulsion: f32,
    /// 碰撞组 (0..16)
    pub collision_group: u8,
    /// 与哪些组发生碰撞的位掩码
    pub collision_mask: u16,
    pub physics_mode: PhysicsMode,
}

impl RigidBodyDescriptor {
    pub fn new(name: impl Into<String>, bone_index: i32, shape: RigidBodyShape, physics_mode: PhysicsMode) -> Self {
        Self {
            name: name.into(),
            bone_index,
            shape,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            mass: 1.0,
            linear_damping: 0.5,
            angular_damping: 0.5,
            friction: 0.5,
            repulsion: 0.0,
            collision_group: 0,
            collision_mask: u16::MAX,
            physics_mode,
        }
    }
}

/// 关节描述（6 自由度弹簧约束）
#[derive(Clone, Debug, PartialEq)]
pub struct JointDescriptor {
    pub name: String,
    pub rigid_body_a: i32,
    pub rigid_body_b: i32,
    /// 模型空间位置
    pub position: Vec3,
    /// 模型空间旋转
    pub rotation: Quat,
    pub linear_lower: Vec3,
    pub linear_upper: Vec3,
    pub angular_lower: Vec3,
    pub angular_upper: Vec3,
    /// 平移弹簧刚度
    pub linear_spring: Vec3,
    /// 旋转弹簧刚度
    pub angular_spring: Vec3,
}

impl JointDescriptor {
    /// 完全锁定的关节
    pub fn new(name: impl Into<String>, rigid_body_a: i32, rigid_body_b: i32) -> Self {
        Self {
            name: name.into(),
            rigid_body_a,
            rigid_body_b,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_lower: Vec3::ZERO,
            linear_upper: Vec3::ZERO,
            angular_lower: Vec3::ZERO,
            angular_upper: Vec3::ZERO,
            linear_spring: Vec3::ZERO,
            angular_spring: Vec3::ZERO,
        }
    }
}

// ============================================================================
// 引擎接口
// ============================================================================

/// 物理引擎：根据骨骼和描述构建每个模型的物理实例
pub trait PhysicsEngine: Send + Sync {
    fn build_physics(
        &self,
        bones: &BoneSet,
        rigid_bodies: &[RigidBodyDescriptor],
        joints: &[JointDescriptor],
    ) -> Result<Box<dyn PhysicsModel>>;
}

/// 单个模型的物理实例，释放即销毁
pub trait PhysicsModel: Send {
    /// 把所有刚体重置到骨骼当前世界姿态并清零速度
    fn initialize(&mut self, bones: &BoneSet);

    /// 运动学刚体跟随骨骼
    fn sync_bodies(&mut self, bones: &BoneSet);

    /// 推进模拟
    fn step(&mut self, delta_seconds: f32);

    /// 动态刚体写回骨骼
    fn sync_bones(&mut self, bones: &mut BoneSet);

    fn rigid_body_count(&self) -> usize;

    fn joint_count(&self) -> usize;
}
