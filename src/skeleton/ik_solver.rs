//! IK 求解器 - CCD（循环坐标下降）
//!
//! 设计原则：
//! - 固定迭代次数，末端足够接近目标时提前结束
//! - 记录最佳姿态，多余的迭代不会让误差变大
//! - 支持欧拉角限制与单轴模式（膝盖等）

use glam::{Mat3, Quat, Vec3};
use std::f32::consts::{FRAC_PI_2, PI};

use super::bone_link::IkDescriptor;
use super::bone_set::BoneSet;

/// 末端与目标的距离平方小于该值视为已到达
const DISTANCE_EPSILON_SQ: f32 = 1.0e-8;

/// 欧拉角分解时的俯仰上限（88°），避免万向节锁
const EULER_THRESHOLD: f32 = 88.0 * PI / 180.0;

// ============================================================================
// IK 链
// ============================================================================

/// 欧拉角旋转顺序，由角度限制范围决定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EulerRotationOrder {
    Yxz,
    Zyx,
    Xzy,
}

/// 求解轴类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SolveAxis {
    /// 三轴
    None,
    /// 所有限制为 0，不参与求解
    Fixed,
    X,
    Y,
    Z,
}

/// 角度限制
#[derive(Clone, Copy, Debug)]
struct AngleLimits {
    min: Vec3,
    max: Vec3,
}

/// IK 链节点
#[derive(Clone, Debug)]
struct IkChain {
    bone: usize,
    limits: Option<AngleLimits>,
    rotation_order: EulerRotationOrder,
    solve_axis: SolveAxis,
}

impl IkChain {
    fn new(bone: usize, angle_min: Option<Vec3>, angle_max: Option<Vec3>) -> Self {
        let limits = match (angle_min, angle_max) {
            (None, None) => None,
            (min, max) => {
                let min = min.unwrap_or(Vec3::splat(-PI));
                let max = max.unwrap_or(Vec3::splat(PI));
                Some(AngleLimits {
                    min: min.min(max),
                    max: min.max(max),
                })
            }
        };

        let Some(limits) = limits else {
            return Self {
                bone,
                limits: None,
                rotation_order: EulerRotationOrder::Xzy,
                solve_axis: SolveAxis::None,
            };
        };

        let (min, max) = (limits.min, limits.max);
        let rotation_order = if -FRAC_PI_2 < min.x && max.x < FRAC_PI_2 {
            EulerRotationOrder::Yxz
        } else if -FRAC_PI_2 < min.y && max.y < FRAC_PI_2 {
            EulerRotationOrder::Zyx
        } else {
            EulerRotationOrder::Xzy
        };

        let x_zero = min.x == 0.0 && max.x == 0.0;
        let y_zero = min.y == 0.0 && max.y == 0.0;
        let z_zero = min.z == 0.0 && max.z == 0.0;
        let solve_axis = match (x_zero, y_zero, z_zero) {
            (true, true, true) => SolveAxis::Fixed,
            (false, true, true) => SolveAxis::X,
            (true, false, true) => SolveAxis::Y,
            (true, true, false) => SolveAxis::Z,
            _ => SolveAxis::None,
        };

        Self {
            bone,
            limits: Some(limits),
            rotation_order,
            solve_axis,
        }
    }
}

// ============================================================================
// IK 求解器
// ============================================================================

/// IK 求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    /// 求解器索引（IK 启用状态数组的下标）
    pub index: usize,
    /// IK 骨骼（要到达的位置）
    pub ik_bone: usize,
    /// 目标骨骼（末端效应器）
    pub target_bone: usize,
    /// 迭代次数
    pub iterations: u32,
    /// 单次迭代角度限制
    pub limit_angle: f32,
    /// 是否启用，索引非法时永久禁用
    pub enabled: bool,
    chains: Vec<IkChain>,
    chain_bones: Vec<usize>,
    /// 迄今最佳姿态的 IK 旋转，每次求解复用
    best_rotations: Vec<Quat>,
}

impl IkSolver {
    /// 创建 IK 求解器，校验所有索引
    pub fn new(index: usize, ik_bone: usize, descriptor: &IkDescriptor, bone_count: usize) -> Self {
        let valid_index = |i: i32| i >= 0 && (i as usize) < bone_count;

        let mut enabled = valid_index(descriptor.target_index)
            && descriptor.target_index as usize != ik_bone;

        let mut chains = Vec::with_capacity(descriptor.links.len());
        for link in &descriptor.links {
            if !valid_index(link.bone_index) || link.bone_index as usize == ik_bone {
                enabled = false;
                continue;
            }
            chains.push(IkChain::new(link.bone_index as usize, link.angle_min, link.angle_max));
        }

        let chain_bones = chains.iter().map(|c| c.bone).collect();
        let best_rotations = vec![Quat::IDENTITY; chains.len()];
        Self {
            index,
            ik_bone,
            target_bone: descriptor.target_index.max(0) as usize,
            iterations: descriptor.iterations,
            limit_angle: descriptor.angle_limit,
            enabled,
            chains,
            chain_bones,
            best_rotations,
        }
    }

    /// IK 链上的骨骼，从靠近末端的骨骼开始
    #[inline]
    pub fn chain_bones(&self) -> &[usize] {
        &self.chain_bones
    }

    /// 求解 IK
    pub fn solve(&mut self, bones: &mut BoneSet) {
        if !self.enabled || self.chains.is_empty() {
            return;
        }

        for chain in &self.chains {
            if let Some(bone) = bones.get_mut(chain.bone) {
                bone.ik_rotation = Some(Quat::IDENTITY);
            }
        }
        self.refresh_chain(bones);

        let ik_position = bones.world_position(self.ik_bone);
        let mut target_position = bones.world_position(self.target_bone);
        let mut best_distance = ik_position.distance_squared(target_position);
        if best_distance < DISTANCE_EPSILON_SQ {
            return;
        }
        self.best_rotations.fill(Quat::IDENTITY);

        let half_iterations = self.iterations / 2;
        for iteration in 0..self.iterations {
            let use_axis = iteration < half_iterations;
            for chain_index in 0..self.chains.len() {
                if self.chains[chain_index].solve_axis == SolveAxis::Fixed {
                    continue;
                }
                target_position =
                    self.solve_chain(bones, chain_index, ik_position, target_position, use_axis);
            }

            let distance = ik_position.distance_squared(target_position);
            if distance < best_distance {
                best_distance = distance;
                for (best, chain) in self.best_rotations.iter_mut().zip(&self.chains) {
                    *best = Self::ik_rotation(bones, chain.bone);
                }
            }
            if distance < DISTANCE_EPSILON_SQ {
                break;
            }
        }

        // 恢复最佳结果
        if ik_position.distance_squared(target_position) > best_distance {
            for (best, chain) in self.best_rotations.iter().zip(&self.chains) {
                if let Some(bone) = bones.get_mut(chain.bone) {
                    bone.ik_rotation = Some(*best);
                }
            }
            self.refresh_chain(bones);
        }
    }

    #[inline]
    fn ik_rotation(bones: &BoneSet, bone: usize) -> Quat {
        bones
            .get(bone)
            .and_then(|b| b.ik_rotation)
            .unwrap_or(Quat::IDENTITY)
    }

    /// 从靠近根部的链节点开始重算本地与世界矩阵
    fn refresh_chain(&self, bones: &mut BoneSet) {
        for chain in self.chains.iter().rev() {
            bones.update_local_matrix(chain.bone);
            bones.update_world_matrix(chain.bone);
        }
    }

    /// 求解单个链节点，返回新的末端位置
    fn solve_chain(
        &self,
        bones: &mut BoneSet,
        chain_index: usize,
        ik_position: Vec3,
        target_position: Vec3,
        use_axis: bool,
    ) -> Vec3 {
        let chain = &self.chains[chain_index];

        let chain_position = bones.world_position(chain.bone);
        let chain_target_vector = (chain_position - target_position).normalize_or_zero();
        let chain_ik_vector = (chain_position - ik_position).normalize_or_zero();

        let rotation_axis = chain_target_vector.cross(chain_ik_vector);
        if rotation_axis.length_squared() < 1.0e-8 {
            return target_position;
        }

        let parent_rotation = match bones.get(chain.bone).and_then(|b| b.parent()) {
            Some(parent) => Mat3::from_mat4(bones.world_matrix(parent)),
            None => Mat3::IDENTITY,
        };

        // 旋转轴转换到父骨骼空间；单轴模式在前半段迭代中锁定到对应轴
        let axis_sign = |dot: f32| if dot >= 0.0 { 1.0 } else { -1.0 };
        let rotation_axis = match (chain.limits.is_some() && use_axis, chain.solve_axis) {
            (true, SolveAxis::X) => Vec3::X * axis_sign(rotation_axis.dot(parent_rotation.x_axis)),
            (true, SolveAxis::Y) => Vec3::Y * axis_sign(rotation_axis.dot(parent_rotation.y_axis)),
            (true, SolveAxis::Z) => Vec3::Z * axis_sign(rotation_axis.dot(parent_rotation.z_axis)),
            _ => (parent_rotation.transpose() * rotation_axis).normalize(),
        };

        let dot = chain_target_vector.dot(chain_ik_vector).clamp(-1.0, 1.0);
        let angle = (self.limit_angle * (chain_index + 1) as f32).min(dot.acos());
        let step = Quat::from_axis_angle(rotation_axis, angle);

        let animated_rotation = bones
            .get(chain.bone)
            .map(|b| b.animated_rotation())
            .unwrap_or(Quat::IDENTITY);
        let mut ik_rotation = step * Self::ik_rotation(bones, chain.bone);

        if let Some(limits) = chain.limits {
            let chain_rotation = Mat3::from_quat(ik_rotation * animated_rotation);
            let limited = Self::limit_rotation(chain_rotation, chain.rotation_order, limits, use_axis);
            ik_rotation = limited * animated_rotation.inverse();
        }

        if let Some(bone) = bones.get_mut(chain.bone) {
            bone.ik_rotation = Some(ik_rotation);
        }
        bones.update_local_matrix(chain.bone);
        bones.update_world_matrix(chain.bone);

        bones.world_position(self.target_bone)
    }

    /// 分解欧拉角、限制后重新组合
    fn limit_rotation(
        m: Mat3,
        order: EulerRotationOrder,
        limits: AngleLimits,
        use_axis: bool,
    ) -> Quat {
        let clamp_pitch = |r: f32| r.clamp(-EULER_THRESHOLD, EULER_THRESHOLD);
        let inv_cos = |r: f32| {
            let c = r.cos();
            if c != 0.0 {
                1.0 / c
            } else {
                c
            }
        };
        let limit = |angle: f32, axis: usize| {
            Self::limit_angle(angle, limits.min[axis], limits.max[axis], use_axis)
        };

        match order {
            EulerRotationOrder::Yxz => {
                let rx = clamp_pitch((-m.z_axis.y).asin());
                let c = inv_cos(rx);
                let ry = (m.z_axis.x * c).atan2(m.z_axis.z * c);
                let rz = (m.x_axis.y * c).atan2(m.y_axis.y * c);
                Quat::from_axis_angle(Vec3::Y, limit(ry, 1))
                    * Quat::from_axis_angle(Vec3::X, limit(rx, 0))
                    * Quat::from_axis_angle(Vec3::Z, limit(rz, 2))
            }
            EulerRotationOrder::Zyx => {
                let ry = clamp_pitch((-m.x_axis.z).asin());
                let c = inv_cos(ry);
                let rx = (m.y_axis.z * c).atan2(m.z_axis.z * c);
                let rz = (m.x_axis.y * c).atan2(m.x_axis.x * c);
                Quat::from_axis_angle(Vec3::Z, limit(rz, 2))
                    * Quat::from_axis_angle(Vec3::Y, limit(ry, 1))
                    * Quat::from_axis_angle(Vec3::X, limit(rx, 0))
            }
            EulerRotationOrder::Xzy => {
                let rz = clamp_pitch((-m.y_axis.x).asin());
                let c = inv_cos(rz);
                let rx = (m.y_axis.z * c).atan2(m.y_axis.y * c);
                let ry = (m.z_axis.x * c).atan2(m.x_axis.x * c);
                Quat::from_axis_angle(Vec3::X, limit(rx, 0))
                    * Quat::from_axis_angle(Vec3::Z, limit(rz, 2))
                    * Quat::from_axis_angle(Vec3::Y, limit(ry, 1))
            }
        }
    }

    /// 超出范围时，前半段迭代允许反射回范围内，否则钳制到边界
    fn limit_angle(angle: f32, min: f32, max: f32, use_axis: bool) -> f32 {
        if angle < min {
            let diff = 2.0 * min - angle;
            if diff <= max && use_axis {
                diff
            } else {
                min
            }
        } else if angle > max {
            let diff = 2.0 * max - angle;
            if diff >= min && use_axis {
                diff
            } else {
                max
            }
        } else {
            angle
        }
    }
}
