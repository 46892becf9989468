//! MMD 运行时模型
//!
//! 每帧顺序：
//! 动画 → Morph → 物理前骨骼更新 → 刚体同步 → 物理步进 → 骨骼回写 → 物理后骨骼更新

use glam::Mat4;

use super::ModelDescriptor;
use crate::animation::{AnimationTarget, ModelAnimation};
use crate::morph::MorphController;
use crate::physics::{PhysicsEngine, PhysicsModel};
use crate::skeleton::BoneSet;
use crate::Result;

/// MMD 运行时模型
pub struct MmdModel {
    pub name: String,

    // 子系统
    bones: BoneSet,
    morphs: MorphController,

    /// 按 IK 求解器索引排列的启用状态
    ik_solver_states: Vec<bool>,
    /// 上一帧的 IK 状态，用于检测关闭
    previous_ik_states: Vec<bool>,

    animation: Option<Box<dyn ModelAnimation>>,
    /// 下一次动画求值前重置 Morph 权重与 IK 状态
    pending_state_reset: bool,

    // 物理系统
    physics: Option<Box<dyn PhysicsModel>>,
    physics_init_requested: bool,

    /// 每完成一帧递增，渲染端据此判断矩阵是否需要重新读取
    skeleton_revision: u64,
}

impl MmdModel {
    /// 创建模型
    ///
    /// 只有并行数组长度不一致会导致失败；其余问题记录日志后降级运行。
    pub fn new(descriptor: ModelDescriptor, physics_engine: Option<&dyn PhysicsEngine>) -> Result<Self> {
        let ModelDescriptor {
            name,
            bones,
            morphs,
            materials,
            rigid_bodies,
            joints,
        } = descriptor;

        let mut bones = BoneSet::new(&bones);
        let morphs = MorphController::new(morphs, materials, bones.len())?;
        let ik_solver_states = vec![true; bones.ik_solver_count()];

        // 静止姿态作为刚体绑定的基准
        bones.update(false, &ik_solver_states);
        bones.update(true, &ik_solver_states);

        let physics = match physics_engine {
            Some(engine) if !rigid_bodies.is_empty() => {
                let physics = engine.build_physics(&bones, &rigid_bodies, &joints)?;
                log::info!(
                    "[模型] '{}' 物理初始化完成: {} 个刚体, {} 个关节",
                    name,
                    physics.rigid_body_count(),
                    physics.joint_count()
                );
                Some(physics)
            }
            Some(_) => {
                log::debug!("[模型] '{}' 没有刚体数据，跳过物理初始化", name);
                None
            }
            None => None,
        };

        log::info!(
            "[模型] '{}' 创建完成: {} 个骨骼, {} 个 IK, {} 个 Morph",
            name,
            bones.len(),
            bones.ik_solver_count(),
            morphs.morph_count()
        );

        Ok(Self {
            name,
            previous_ik_states: ik_solver_states.clone(),
            ik_solver_states,
            bones,
            morphs,
            animation: None,
            pending_state_reset: false,
            physics_init_requested: physics.is_some(),
            physics,
            skeleton_revision: 0,
        })
    }

    // ========== 访问 ==========

    #[inline]
    pub fn bones(&self) -> &BoneSet {
        &self.bones
    }

    #[inline]
    pub fn bones_mut(&mut self) -> &mut BoneSet {
        &mut self.bones
    }

    #[inline]
    pub fn morphs(&self) -> &MorphController {
        &self.morphs
    }

    #[inline]
    pub fn morphs_mut(&mut self) -> &mut MorphController {
        &mut self.morphs
    }

    #[inline]
    pub fn ik_solver_states(&self) -> &[bool] {
        &self.ik_solver_states
    }

    #[inline]
    pub fn has_physics(&self) -> bool {
        self.physics.is_some()
    }

    #[inline]
    pub fn skeleton_revision(&self) -> u64 {
        self.skeleton_revision
    }

    #[inline]
    pub fn world_matrices(&self) -> &[Mat4] {
        self.bones.world_matrices()
    }

    /// 蒙皮矩阵写入调用方缓冲区
    pub fn skinning_matrices(&self, out: &mut Vec<Mat4>) {
        self.bones.skinning_matrices(out);
    }

    // ========== IK ==========

    /// 启用或禁用 IK 求解器，禁用时清除链上残留的 IK 旋转
    pub fn set_ik_enabled(&mut self, solver_index: usize, enabled: bool) {
        let Some(state) = self.ik_solver_states.get_mut(solver_index) else {
            log::warn!("[模型] '{}': IK 索引 {} 超出范围", self.name, solver_index);
            return;
        };
        if *state && !enabled {
            self.bones.clear_ik_rotations(solver_index);
        }
        *state = enabled;
        self.previous_ik_states[solver_index] = enabled;
    }

    // ========== 动画 ==========

    /// 设置动画，下一次求值前重置 Morph 权重与 IK 状态
    pub fn set_animation(&mut self, animation: Option<Box<dyn ModelAnimation>>) {
        self.animation = animation.map(|mut animation| {
            animation.bind(&self.bones, &self.morphs);
            animation
        });
        self.pending_state_reset = true;
    }

    #[inline]
    pub fn has_animation(&self) -> bool {
        self.animation.is_some()
    }

    /// 动画长度（帧），没有动画时为 0
    pub fn animation_duration(&self) -> f32 {
        self.animation.as_ref().map_or(0.0, |a| a.duration())
    }

    /// 请求在下一帧物理前阶段之后重置刚体
    pub fn initialize_physics(&mut self) {
        if self.physics.is_some() {
            self.physics_init_requested = true;
        }
    }

    // ========== 帧更新 ==========

    /// 物理前阶段
    ///
    /// `frame_time` 为 `Some` 时先求值动画；`None` 只处理手动写入的姿态与权重。
    pub fn before_physics(&mut self, frame_time: Option<f32>) {
        if let Some(frame_time) = frame_time {
            if self.pending_state_reset {
                self.pending_state_reset = false;
                self.morphs.reset_morph_weights();
                self.ik_solver_states.fill(true);
            }

            if let Some(animation) = self.animation.as_mut() {
                let mut target = AnimationTarget {
                    bones: &mut self.bones,
                    morphs: &mut self.morphs,
                    ik_states: &mut self.ik_solver_states,
                };
                animation.animate(frame_time, &mut target);
            }
        }

        self.clear_disabled_ik_rotations();
        self.morphs.update(&mut self.bones);
        self.bones.update(false, &self.ik_solver_states);

        if let Some(physics) = self.physics.as_mut() {
            if self.physics_init_requested {
                self.physics_init_requested = false;
                physics.initialize(&self.bones);
                log::debug!("[模型] '{}' 物理已重置", self.name);
            }
            physics.sync_bodies(&self.bones);
        }
    }

    /// 推进物理模拟
    pub fn step_physics(&mut self, delta_seconds: f32) {
        if let Some(physics) = self.physics.as_mut() {
            physics.step(delta_seconds);
        }
    }

    /// 物理后阶段
    pub fn after_physics(&mut self) {
        if let Some(physics) = self.physics.as_mut() {
            physics.sync_bones(&mut self.bones);
        }
        self.bones.update(true, &self.ik_solver_states);
        self.skeleton_revision += 1;
    }

    /// 完整求值一帧
    pub fn evaluate(&mut self, frame_time: Option<f32>, delta_seconds: f32) {
        self.before_physics(frame_time);
        self.step_physics(delta_seconds);
        self.after_physics();
    }

    /// 动画把 IK 从开切到关时，链上的 IK 旋转不能残留
    fn clear_disabled_ik_rotations(&mut self) {
        for (solver, (&previous, &current)) in self
            .previous_ik_states
            .iter()
            .zip(&self.ik_solver_states)
            .enumerate()
        {
            if previous && !current {
                self.bones.clear_ik_rotations(solver);
            }
        }
        self.previous_ik_states.copy_from_slice(&self.ik_solver_states);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use glam::{Quat, Vec3};

    use super::*;
    use crate::animation::{IkKeyframe, KeyframeAnimation, MorphKeyframe};
    use crate::morph::RuntimeMorph;
    use crate::physics::{JointDescriptor, PhysicsMode, RigidBodyDescriptor, RigidBodyShape};
    use crate::skeleton::{BoneFlags, BoneMetadata, IkDescriptor, IkLinkDescriptor};
    use crate::MmdError;

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct RecordingEngine {
        calls: CallLog,
    }

    struct RecordingPhysics {
        calls: CallLog,
    }

    impl PhysicsEngine for RecordingEngine {
        fn build_physics(
            &self,
            _bones: &BoneSet,
            rigid_bodies: &[RigidBodyDescriptor],
            _joints: &[JointDescriptor],
        ) -> Result<Box<dyn PhysicsModel>> {
            assert_eq!(rigid_bodies.len(), 1);
            Ok(Box::new(RecordingPhysics { calls: self.calls.clone() }))
        }
    }

    impl PhysicsModel for RecordingPhysics {
        fn initialize(&mut self, _bones: &BoneSet) {
            self.calls.lock().unwrap().push("initialize");
        }
        fn sync_bodies(&mut self, _bones: &BoneSet) {
            self.calls.lock().unwrap().push("sync_bodies");
        }
        fn step(&mut self, _delta_seconds: f32) {
            self.calls.lock().unwrap().push("step");
        }
        fn sync_bones(&mut self, _bones: &mut BoneSet) {
            self.calls.lock().unwrap().push("sync_bones");
        }
        fn rigid_body_count(&self) -> usize {
            1
        }
        fn joint_count(&self) -> usize {
            0
        }
    }

    /// 腿 + IK：0 = 右足ＩＫ，1 = 右足，2 = 右ひざ，3 = 右足首
    fn leg() -> Vec<BoneMetadata> {
        let mut ik = BoneMetadata::new("右足ＩＫ", -1, Vec3::new(1.0, 1.0, 0.0));
        ik.flags |= BoneFlags::IK;
        ik.ik = Some(IkDescriptor {
            target_index: 3,
            iterations: 20,
            angle_limit: 1.0,
            links: vec![IkLinkDescriptor::new(2), IkLinkDescriptor::new(1)],
        });
        vec![
            ik,
            BoneMetadata::new("右足", -1, Vec3::new(0.0, 10.0, 0.0)),
            BoneMetadata::new("右ひざ", 1, Vec3::new(0.0, -4.5, 0.0)),
            BoneMetadata::new("右足首", 2, Vec3::new(0.0, -4.5, 0.0)),
        ]
    }

    fn has_ik_rotation(model: &MmdModel) -> bool {
        model
            .bones()
            .bones()
            .iter()
            .any(|b| b.ik_rotation.is_some_and(|q| !q.abs_diff_eq(Quat::IDENTITY, 1e-5)))
    }

    #[test]
    fn test_physics_call_order() {
        init_logger();
        let calls = CallLog::default();
        let engine = RecordingEngine { calls: calls.clone() };
        let descriptor = ModelDescriptor::new("miku", leg()).with_physics(
            vec![RigidBodyDescriptor::new(
                "足",
                1,
                RigidBodyShape::Sphere { radius: 1.0 },
                PhysicsMode::Kinematic,
            )],
            Vec::new(),
        );
        let mut model = MmdModel::new(descriptor, Some(&engine)).unwrap();
        assert!(model.has_physics());

        model.evaluate(Some(0.0), 1.0 / 60.0);
        model.evaluate(Some(1.0), 1.0 / 60.0);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "initialize", "sync_bodies", "step", "sync_bones",
                "sync_bodies", "step", "sync_bones",
            ]
        );

        calls.lock().unwrap().clear();
        model.initialize_physics();
        model.evaluate(None, 1.0 / 60.0);
        assert_eq!(calls.lock().unwrap()[0], "initialize");
    }

    #[test]
    fn test_no_rigid_bodies_skips_physics() {
        let calls = CallLog::default();
        let engine = RecordingEngine { calls: calls.clone() };
        let mut model = MmdModel::new(ModelDescriptor::new("miku", leg()), Some(&engine)).unwrap();
        assert!(!model.has_physics());
        model.evaluate(Some(0.0), 1.0 / 60.0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabling_ik_clears_rotations() {
        let mut model = MmdModel::new(ModelDescriptor::new("miku", leg()), None).unwrap();
        model.evaluate(None, 0.0);
        assert!(has_ik_rotation(&model));

        model.set_ik_enabled(0, false);
        assert!(!has_ik_rotation(&model));
        model.evaluate(None, 0.0);
        assert!(!has_ik_rotation(&model));
        assert!(model.bones().world_position(3).abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-4));
    }

    #[test]
    fn test_animation_ik_track_toggles_solver() {
        let mut model = MmdModel::new(ModelDescriptor::new("miku", leg()), None).unwrap();
        let mut animation = KeyframeAnimation::new("walk");
        let track = animation.ik_track_mut("右足ＩＫ");
        track.insert_keyframe(IkKeyframe { frame_index: 0, enabled: true });
        track.insert_keyframe(IkKeyframe { frame_index: 10, enabled: false });
        model.set_animation(Some(Box::new(animation)));

        model.evaluate(Some(0.0), 0.0);
        assert!(has_ik_rotation(&model));
        model.evaluate(Some(10.0), 0.0);
        assert_eq!(model.ik_solver_states(), &[false]);
        assert!(!has_ik_rotation(&model));
    }

    #[test]
    fn test_set_animation_resets_state() {
        let descriptor = ModelDescriptor::new("miku", leg())
            .with_morphs(vec![RuntimeMorph::group("笑い", vec![], vec![])]);
        let mut model = MmdModel::new(descriptor, None).unwrap();
        model.morphs_mut().set_morph_weight("笑い", 0.8);
        model.set_ik_enabled(0, false);

        let mut animation = KeyframeAnimation::new("idle");
        animation
            .morph_track_mut("あ")
            .insert_keyframe(MorphKeyframe { frame_index: 0, weight: 1.0 });
        model.set_animation(Some(Box::new(animation)));

        // 手动求值不触发重置
        model.evaluate(None, 0.0);
        assert_eq!(model.morphs().get_morph_weight("笑い"), 0.8);

        model.evaluate(Some(0.0), 0.0);
        assert_eq!(model.morphs().get_morph_weight("笑い"), 0.0);
        assert_eq!(model.ik_solver_states(), &[true]);
        assert_eq!(model.animation_duration(), 0.0);
    }

    #[test]
    fn test_revision_increments_per_frame() {
        let mut model = MmdModel::new(ModelDescriptor::new("miku", leg()), None).unwrap();
        assert_eq!(model.skeleton_revision(), 0);
        model.evaluate(None, 0.0);
        model.before_physics(None);
        assert_eq!(model.skeleton_revision(), 1);
        model.after_physics();
        assert_eq!(model.skeleton_revision(), 2);
    }

    #[test]
    fn test_malformed_morph_fails_construction() {
        init_logger();
        let descriptor = ModelDescriptor::new("miku", leg()).with_morphs(vec![RuntimeMorph::bone(
            "壊れ",
            vec![1, 2],
            vec![Vec3::ZERO],
            vec![Quat::IDENTITY, Quat::IDENTITY],
        )]);
        let result = MmdModel::new(descriptor, None);
        assert!(matches!(
            result,
            Err(MmdError::ArrayLengthMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_skinning_matrices_match_bone_count() {
        let model = MmdModel::new(ModelDescriptor::new("miku", leg()), None).unwrap();
        let mut out = Vec::new();
        model.skinning_matrices(&mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(model.world_matrices().len(), 4);
    }
}
