//! 基于 rapier3d 的物理实现
//!
//! 每个模型一个独立的物理世界，物理在模型空间运行。
//! 流程：build → 每帧 [sync_bodies → step → sync_bones]

use glam::{Mat4, Quat, Vec3};
use rapier3d::na;
use rapier3d::prelude::*;

use super::bridge::RigidBodyBinding;
use super::config::{get_config, PhysicsConfig};
use super::{JointDescriptor, PhysicsEngine, PhysicsModel, RigidBodyDescriptor, RigidBodyShape};
use crate::skeleton::BoneSet;
use crate::{MmdError, Result};

/// 形状尺寸下限，避免退化碰撞体
const MIN_SHAPE_SIZE: f32 = 1e-3;

// ============================================================================
// 坐标转换
// ============================================================================

fn mat4_to_isometry(m: Mat4) -> na::Isometry3<f32> {
    let (_, rotation, translation) = m.to_scale_rotation_translation();
    na::Isometry3::from_parts(
        na::Translation3::new(translation.x, translation.y, translation.z),
        na::UnitQuaternion::from_quaternion(na::Quaternion::new(
            rotation.w, rotation.x, rotation.y, rotation.z,
        )),
    )
}

fn isometry_to_mat4(iso: &na::Isometry3<f32>) -> Mat4 {
    let t = iso.translation.vector;
    let q = iso.rotation.quaternion();
    Mat4::from_rotation_translation(
        Quat::from_xyzw(q.i, q.j, q.k, q.w),
        Vec3::new(t.x, t.y, t.z),
    )
}

// ============================================================================
// 引擎
// ============================================================================

/// rapier3d 物理引擎
#[derive(Debug, Default, Clone, Copy)]
pub struct RapierPhysicsEngine;

impl PhysicsEngine for RapierPhysicsEngine {
    fn build_physics(
        &self,
        bones: &BoneSet,
        rigid_bodies: &[RigidBodyDescriptor],
        joints: &[JointDescriptor],
    ) -> Result<Box<dyn PhysicsModel>> {
        let config = get_config();
        if !config.physics_fps.is_finite() || config.physics_fps <= 0.0 {
            return Err(MmdError::Physics(format!("物理 FPS 非法: {}", config.physics_fps)));
        }
        Ok(Box::new(RapierPhysicsModel::new(bones, rigid_bodies, joints)))
    }
}

struct PhysicsBody {
    binding: RigidBodyBinding,
    handle: RigidBodyHandle,
}

/// 单个模型的 rapier 物理世界
pub struct RapierPhysicsModel {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    gravity: na::Vector3<f32>,

    fixed_time_step: f32,
    max_substep_count: u32,
    max_linear_velocity: f32,
    max_angular_velocity: f32,
    /// 尚未消化的模拟时间
    time_accumulator: f32,

    bodies: Vec<PhysicsBody>,
    joints: Vec<ImpulseJointHandle>,
}

impl RapierPhysicsModel {
    /// 按当前全局配置构建
    pub fn new(bones: &BoneSet, rigid_bodies: &[RigidBodyDescriptor], joints: &[JointDescriptor]) -> Self {
        let config = get_config();
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.fixed_time_step();

        if config.debug_log {
            log::debug!(
                "[物理] 世界创建: FPS={}, 重力Y={}",
                config.physics_fps,
                config.gravity_y
            );
        }

        let mut model = Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: na::Vector3::new(0.0, config.gravity_y, 0.0),
            fixed_time_step: config.fixed_time_step(),
            max_substep_count: config.max_substep_count.max(1),
            max_linear_velocity: config.max_linear_velocity,
            max_angular_velocity: config.max_angular_velocity,
            time_accumulator: 0.0,
            bodies: Vec::with_capacity(rigid_bodies.len()),
            joints: Vec::new(),
        };

        for descriptor in rigid_bodies {
            model.add_rigid_body(descriptor, bones, &config);
        }
        if config.joints_enabled {
            for descriptor in joints {
                model.add_joint(descriptor, bones, &config);
            }
        }

        let dynamic_count = model.bodies.iter().filter(|b| b.binding.is_dynamic()).count();
        log::info!(
            "[物理] 构建完成: {} 刚体 ({} 跟骨 + {} 物理), {} 关节",
            model.bodies.len(),
            model.bodies.len() - dynamic_count,
            dynamic_count,
            model.joints.len()
        );
        model
    }

    fn add_rigid_body(&mut self, descriptor: &RigidBodyDescriptor, bones: &BoneSet, config: &PhysicsConfig) {
        let binding = RigidBodyBinding::new(descriptor, bones);
        let body_type = if binding.is_dynamic() {
            RigidBodyType::Dynamic
        } else {
            RigidBodyType::KinematicPositionBased
        };

        let body = RigidBodyBuilder::new(body_type)
            .position(mat4_to_isometry(binding.body_transform(bones)))
            .linear_damping(descriptor.linear_damping * config.linear_damping_scale)
            .angular_damping(descriptor.angular_damping * config.angular_damping_scale)
            .can_sleep(false)
            .build();
        let handle = self.rigid_body_set.insert(body);

        let shape = match descriptor.shape {
            RigidBodyShape::Sphere { radius } => SharedShape::ball(radius.max(MIN_SHAPE_SIZE)),
            RigidBodyShape::Box { half_extents } => {
                let h = half_extents.max(Vec3::splat(MIN_SHAPE_SIZE));
                SharedShape::cuboid(h.x, h.y, h.z)
            }
            RigidBodyShape::Capsule { radius, height } => SharedShape::capsule_y(
                (height * 0.5).max(MIN_SHAPE_SIZE),
                radius.max(MIN_SHAPE_SIZE),
            ),
        };

        let groups = InteractionGroups::new(
            Group::from_bits_truncate(1u32 << descriptor.collision_group.min(15)),
            Group::from_bits_truncate(descriptor.collision_mask as u32),
        );
        let builder = ColliderBuilder::new(shape)
            .restitution(descriptor.repulsion)
            .friction(descriptor.friction)
            .collision_groups(groups);
        let builder = if binding.is_dynamic() {
            builder.mass(descriptor.mass.max(MIN_SHAPE_SIZE) * config.mass_scale)
        } else {
            builder.density(0.0)
        };
        self.collider_set
            .insert_with_parent(builder.build(), handle, &mut self.rigid_body_set);

        self.bodies.push(PhysicsBody { binding, handle });
    }

    fn add_joint(&mut self, descriptor: &JointDescriptor, bones: &BoneSet, config: &PhysicsConfig) {
        let index = |i: i32| usize::try_from(i).ok().filter(|&i| i < self.bodies.len());
        let (Some(a), Some(b)) = (index(descriptor.rigid_body_a), index(descriptor.rigid_body_b)) else {
            log::warn!(
                "[物理] 关节 '{}' 的刚体索引 ({}, {}) 无效，跳过",
                descriptor.name,
                descriptor.rigid_body_a,
                descriptor.rigid_body_b
            );
            return;
        };
        if a == b {
            log::warn!("[物理] 关节 '{}' 连接同一个刚体，跳过", descriptor.name);
            return;
        }

        let joint_world = Mat4::from_rotation_translation(descriptor.rotation.normalize(), descriptor.position);
        let frame_a = self.bodies[a].binding.body_transform(bones).inverse() * joint_world;
        let frame_b = self.bodies[b].binding.body_transform(bones).inverse() * joint_world;

        let linear = [
            (JointAxis::LinX, JointAxesMask::LIN_X, descriptor.linear_lower.x, descriptor.linear_upper.x, descriptor.linear_spring.x),
            (JointAxis::LinY, JointAxesMask::LIN_Y, descriptor.linear_lower.y, descriptor.linear_upper.y, descriptor.linear_spring.y),
            (JointAxis::LinZ, JointAxesMask::LIN_Z, descriptor.linear_lower.z, descriptor.linear_upper.z, descriptor.linear_spring.z),
        ];
        let angular = [
            (JointAxis::AngX, JointAxesMask::ANG_X, descriptor.angular_lower.x, descriptor.angular_upper.x, descriptor.angular_spring.x),
            (JointAxis::AngY, JointAxesMask::ANG_Y, descriptor.angular_lower.y, descriptor.angular_upper.y, descriptor.angular_spring.y),
            (JointAxis::AngZ, JointAxesMask::ANG_Z, descriptor.angular_lower.z, descriptor.angular_upper.z, descriptor.angular_spring.z),
        ];

        // 上下限相同（或颠倒）的轴锁定
        let mut locked = JointAxesMask::empty();
        for &(_, mask, lower, upper, _) in linear.iter().chain(&angular) {
            if lower >= upper {
                locked |= mask;
            }
        }

        let mut joint = GenericJointBuilder::new(locked)
            .local_frame1(mat4_to_isometry(frame_a))
            .local_frame2(mat4_to_isometry(frame_b))
            .contacts_enabled(false)
            .build();

        for &(axis, mask, lower, upper, spring) in linear.iter().chain(&angular) {
            if locked.contains(mask) {
                continue;
            }
            joint.set_limits(axis, [lower, upper]);
            if spring != 0.0 {
                // 弹簧用目标为 0 的位置电机模拟
                let stiffness = spring * config.spring_stiffness_scale;
                joint.set_motor(axis, 0.0, 0.0, stiffness, stiffness.abs().sqrt());
            }
        }

        let handle = self.impulse_joint_set.insert(
            self.bodies[a].handle,
            self.bodies[b].handle,
            joint,
            true,
        );
        self.joints.push(handle);
    }

    /// 刚体当前世界变换
    pub fn body_world_transform(&self, index: usize) -> Option<Mat4> {
        let body = self.bodies.get(index)?;
        self.rigid_body_set
            .get(body.handle)
            .map(|rb| isometry_to_mat4(rb.position()))
    }

    fn step_once(&mut self) {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );
    }

    /// 截断超速刚体，防止卡模时物理爆炸
    fn clamp_velocities(&mut self) {
        for body in &self.bodies {
            if !body.binding.is_dynamic() {
                continue;
            }
            let Some(rb) = self.rigid_body_set.get_mut(body.handle) else {
                continue;
            };
            let linvel = *rb.linvel();
            let speed = linvel.norm();
            if speed > self.max_linear_velocity {
                rb.set_linvel(linvel * (self.max_linear_velocity / speed), true);
            }
            let angvel = *rb.angvel();
            let speed = angvel.norm();
            if speed > self.max_angular_velocity {
                rb.set_angvel(angvel * (self.max_angular_velocity / speed), true);
            }
        }
    }
}

impl PhysicsModel for RapierPhysicsModel {
    fn initialize(&mut self, bones: &BoneSet) {
        self.time_accumulator = 0.0;
        for body in &self.bodies {
            let Some(rb) = self.rigid_body_set.get_mut(body.handle) else {
                continue;
            };
            let iso = mat4_to_isometry(body.binding.body_transform(bones));
            rb.set_position(iso, true);
            if !body.binding.is_dynamic() {
                rb.set_next_kinematic_position(iso);
            }
            rb.set_linvel(na::Vector3::zeros(), true);
            rb.set_angvel(na::Vector3::zeros(), true);
            rb.reset_forces(true);
        }
    }

    fn sync_bodies(&mut self, bones: &BoneSet) {
        for body in &self.bodies {
            if body.binding.is_dynamic() || body.binding.bone.is_none() {
                continue;
            }
            if let Some(rb) = self.rigid_body_set.get_mut(body.handle) {
                rb.set_next_kinematic_position(mat4_to_isometry(body.binding.body_transform(bones)));
            }
        }
    }

    /// 固定步长推进，单帧最多 max_substep_count 步，超出的时间丢弃
    fn step(&mut self, delta_seconds: f32) {
        self.time_accumulator += delta_seconds.max(0.0);
        let mut substeps = 0;
        while self.time_accumulator >= self.fixed_time_step && substeps < self.max_substep_count {
            self.step_once();
            self.time_accumulator -= self.fixed_time_step;
            substeps += 1;
        }
        if substeps == self.max_substep_count {
            self.time_accumulator = self.time_accumulator.min(self.fixed_time_step);
        }
        if substeps > 0 {
            self.clamp_velocities();
        }
    }

    fn sync_bones(&mut self, bones: &mut BoneSet) {
        for body in &self.bodies {
            if !body.binding.is_dynamic() {
                continue;
            }
            if let Some(rb) = self.rigid_body_set.get(body.handle) {
                body.binding.write_back(isometry_to_mat4(rb.position()), bones);
            }
        }
    }

    fn rigid_body_count(&self) -> usize {
        self.bodies.len()
    }

    fn joint_count(&self) -> usize {
        self.joints.len()
    }
}
