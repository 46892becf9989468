//! 骨骼系统
//!
//! 核心设计思想：
//! - BoneMetadata: 模型资源中的不可变骨骼描述
//! - RuntimeBone: 单个骨骼节点的每帧状态
//! - BoneSet: 骨骼数组 + 索引表示的层次结构，负责两阶段更新
//! - AppendSolver / IkSolver: 附加变换与 IK 求解器

mod append_solver;
mod bone_link;
mod bone_set;
mod ik_solver;

pub use append_solver::AppendSolver;
pub use bone_link::{
    AppendTransform, BoneFlags, BoneMetadata, IkDescriptor, IkLinkDescriptor, RuntimeBone,
};
pub use bone_set::BoneSet;
pub use ik_solver::IkSolver;
