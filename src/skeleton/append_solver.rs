//! 附加变换（付与）求解器
//!
//! 将目标骨骼的一部分旋转 / 平移按比率传递给当前骨骼。

use glam::{Quat, Vec3};

use super::bone_link::{BoneFlags, RuntimeBone};

/// 附加变换求解器
#[derive(Clone, Debug)]
pub struct AppendSolver {
    /// 被影响的骨骼
    pub bone: usize,
    /// 附加变换来源骨骼
    pub target_bone: usize,
    /// 比率
    pub ratio: f32,
    /// 使用来源骨骼的本地动画值，而不是其附加结果
    pub is_local: bool,
    pub affect_rotation: bool,
    pub affect_position: bool,
    /// 计算结果：附加旋转
    pub(crate) rotation_offset: Quat,
    /// 计算结果：附加平移
    pub(crate) position_offset: Vec3,
}

impl AppendSolver {
    pub fn new(bone: usize, target_bone: usize, flags: BoneFlags, ratio: f32) -> Self {
        Self {
            bone,
            target_bone,
            ratio,
            is_local: flags.contains(BoneFlags::APPEND_LOCAL),
            affect_rotation: flags.contains(BoneFlags::APPEND_ROTATE),
            affect_position: flags.contains(BoneFlags::APPEND_TRANSLATE),
            rotation_offset: Quat::IDENTITY,
            position_offset: Vec3::ZERO,
        }
    }

    #[inline]
    pub fn rotation_offset(&self) -> Quat {
        self.rotation_offset
    }

    #[inline]
    pub fn position_offset(&self) -> Vec3 {
        self.position_offset
    }

    /// 计算附加偏移
    ///
    /// 来源骨骼本身也有附加变换且不是本地模式时，沿用其附加结果（链式付与）。
    /// 来源骨骼带有 IK 旋转时，IK 旋转左乘到来源旋转上。
    pub(crate) fn compute(&self, bones: &[RuntimeBone], solvers: &[AppendSolver]) -> (Quat, Vec3) {
        let target = &bones[self.target_bone];
        let chained = if self.is_local {
            None
        } else {
            target.append_solver.map(|index| &solvers[index])
        };

        let rotation = if self.affect_rotation {
            let mut rotation = match chained {
                Some(solver) => solver.rotation_offset,
                None => target.animated_rotation(),
            };
            if let Some(ik_rotation) = target.ik_rotation {
                rotation = ik_rotation * rotation;
            }
            Quat::IDENTITY.slerp(rotation, self.ratio)
        } else {
            self.rotation_offset
        };

        let position = if self.affect_position {
            let position = match chained {
                Some(solver) => solver.position_offset,
                None => target.animation_position_offset(),
            };
            position * self.ratio
        } else {
            self.position_offset
        };

        (rotation, position)
    }
}
