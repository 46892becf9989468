//! MMD 运行时
//!
//! 管理所有模型实例与播放状态，每帧按求值模式驱动模型：
//! - Immediate：当前帧同步求值（默认）
//! - Buffered：工作线程求值下一帧，消费端读取上一帧的前缓冲区

mod buffered;
mod player;
mod spinlock;

pub use buffered::{BufferedEvaluator, WorldMatrixBuffer};
pub use player::{AnimationPlayer, PlaybackState, FRAMES_PER_SECOND, PHYSICS_REINIT_FRAME_THRESHOLD};
pub use spinlock::{Spinlock, SpinlockGuard};

use std::sync::{Arc, Mutex, MutexGuard};

use glam::Mat4;
use rayon::prelude::*;

use crate::animation::ModelAnimation;
use crate::model::{MmdModel, ModelDescriptor};
use crate::physics::PhysicsEngine;
use crate::{MmdError, Result};

/// 模型句柄
pub type ModelId = usize;

/// 动画求值模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EvaluationType {
    /// 每帧同步求值
    #[default]
    Immediate,
    /// 与渲染重叠的异步求值，结果延迟一帧可见
    Buffered,
}

/// 运行时配置
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub evaluation_type: EvaluationType,
    /// 跳转超过该帧数时重置物理，默认 60（2 秒）
    pub physics_reinit_frame_threshold: f32,
    /// 帧时间的帧率，默认 30
    pub frame_rate: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            evaluation_type: EvaluationType::Immediate,
            physics_reinit_frame_threshold: PHYSICS_REINIT_FRAME_THRESHOLD,
            frame_rate: FRAMES_PER_SECOND,
        }
    }
}

struct ModelEntry {
    id: ModelId,
    model: Arc<Mutex<MmdModel>>,
    /// 仅 Buffered 模式下存在
    buffer: Option<Arc<WorldMatrixBuffer>>,
}

pub struct MmdRuntime {
    config: RuntimeConfig,
    lock: Arc<Spinlock>,
    physics_engine: Option<Arc<dyn PhysicsEngine>>,
    models: Vec<ModelEntry>,
    next_id: ModelId,
    player: AnimationPlayer,
    /// Buffered 模式下的工作线程调度
    evaluator: Option<BufferedEvaluator>,
    /// 新模型或跳转后，下一帧必须同步求值
    need_sync_evaluate: bool,
}

impl Default for MmdRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl MmdRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let evaluation_type = config.evaluation_type;
        let player = AnimationPlayer::default()
            .with_frame_rate(config.frame_rate)
            .with_physics_reinit_threshold(config.physics_reinit_frame_threshold);
        let mut runtime = Self {
            config: RuntimeConfig {
                evaluation_type: EvaluationType::Immediate,
                ..config
            },
            lock: Arc::new(Spinlock::new()),
            physics_engine: None,
            models: Vec::new(),
            next_id: 0,
            player,
            evaluator: None,
            need_sync_evaluate: false,
        };
        runtime.set_evaluation_type(evaluation_type);
        runtime
    }

    /// 设置物理引擎，对之后加入的模型生效
    pub fn with_physics_engine(mut self, engine: Arc<dyn PhysicsEngine>) -> Self {
        self.physics_engine = Some(engine);
        self
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn lock(&self) -> &Arc<Spinlock> {
        &self.lock
    }

    #[inline]
    pub fn player(&self) -> &AnimationPlayer {
        &self.player
    }

    #[inline]
    pub fn evaluation_type(&self) -> EvaluationType {
        self.config.evaluation_type
    }

    #[inline]
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    // ========== 模型管理 ==========

    /// 创建并加入模型，下一帧同步求值
    pub fn add_model(&mut self, descriptor: ModelDescriptor) -> Result<ModelId> {
        let model = MmdModel::new(descriptor, self.physics_engine.as_deref())?;
        let model = Arc::new(Mutex::new(model));

        let buffer = self.evaluator.as_mut().map(|e| e.attach(model.clone()));
        let id = self.next_id;
        self.next_id += 1;
        self.models.push(ModelEntry { id, model, buffer });
        self.need_sync_evaluate = true;
        self.refresh_duration();

        log::info!("[运行时] 加入模型 #{}，当前 {} 个模型", id, self.models.len());
        Ok(id)
    }

    pub fn remove_model(&mut self, id: ModelId) -> Result<()> {
        let position = self.position(id)?;
        self.lock.wait();
        let entry = self.models.remove(position);
        if let Some(evaluator) = self.evaluator.as_mut() {
            evaluator.detach(&entry.model);
        }
        self.refresh_duration();
        log::info!("[运行时] 移除模型 #{}", id);
        Ok(())
    }

    /// 模型句柄；访问前调用方应先 `lock().wait()`
    pub fn model(&self, id: ModelId) -> Result<Arc<Mutex<MmdModel>>> {
        let position = self.position(id)?;
        Ok(self.models[position].model.clone())
    }

    /// 设置模型动画并更新播放长度
    pub fn set_animation(&mut self, id: ModelId, animation: Option<Box<dyn ModelAnimation>>) -> Result<()> {
        let position = self.position(id)?;
        self.lock.wait();
        lock_model(&self.models[position].model)?.set_animation(animation);
        self.need_sync_evaluate = true;
        self.refresh_duration();
        Ok(())
    }

    // ========== 播放控制 ==========

    pub fn play(&mut self) {
        self.player.play();
    }

    pub fn pause(&mut self) {
        self.player.pause();
    }

    pub fn set_time_scale(&mut self, time_scale: f32) {
        self.player.set_time_scale(time_scale);
    }

    /// 跳转到指定帧
    ///
    /// Immediate 模式下 `force_evaluate` 会立即同步求值；
    /// Buffered 模式下总是在下一次 update 中同步求值跳转后的帧。
    pub fn seek(&mut self, frame_time: f32, force_evaluate: bool) -> Result<()> {
        let buffered = self.config.evaluation_type == EvaluationType::Buffered;
        self.player.seek(frame_time, force_evaluate && !buffered);
        let frame_time = self.player.current_frame_time();
        match self.evaluator.as_mut() {
            Some(evaluator) => {
                evaluator.set_last_requested(Some(frame_time));
                self.need_sync_evaluate = true;
            }
            None if self.player.take_sync_evaluate_request() => {
                self.apply_physics_init_request();
                self.lock.wait();
                self.evaluate_immediate(Some(frame_time), 0.0);
            }
            None => {}
        }
        Ok(())
    }

    // ========== 求值模式 ==========

    /// 切换求值模式，切换本身是同步的
    pub fn set_evaluation_type(&mut self, evaluation_type: EvaluationType) {
        if self.config.evaluation_type == evaluation_type {
            return;
        }
        self.lock.wait();

        match evaluation_type {
            EvaluationType::Buffered => {
                let mut evaluator = BufferedEvaluator::new(self.lock.clone());
                for entry in &mut self.models {
                    entry.buffer = Some(evaluator.attach(entry.model.clone()));
                }
                self.evaluator = Some(evaluator);
                self.need_sync_evaluate = true;
            }
            EvaluationType::Immediate => {
                if let Some(mut evaluator) = self.evaluator.take() {
                    evaluator.finish();
                }
                for entry in &mut self.models {
                    entry.buffer = None;
                }
            }
        }
        self.config.evaluation_type = evaluation_type;
        log::debug!("[运行时] 求值模式: {:?}", evaluation_type);
    }

    // ========== 帧更新 ==========

    /// 推进 `delta_ms` 毫秒并驱动所有模型
    pub fn update(&mut self, delta_ms: f32) -> Result<()> {
        let delta_seconds = delta_ms / 1000.0;
        let forced = self.player.take_sync_evaluate_request();
        let frame_time = self
            .player
            .advance(delta_ms)
            .or_else(|| forced.then(|| self.player.current_frame_time()));

        self.lock.wait();
        self.apply_physics_init_request();

        match self.evaluator.as_mut() {
            None => {
                self.evaluate_immediate(frame_time, delta_seconds);
                self.need_sync_evaluate = false;
            }
            Some(evaluator) => {
                if std::mem::take(&mut self.need_sync_evaluate) {
                    match evaluator.last_requested() {
                        Some(previous) => {
                            evaluator.evaluate_sync(Some(previous), 0.0);
                            evaluator.swap();
                            evaluator.request(frame_time, delta_seconds);
                        }
                        // 还没有请求过任何帧：同步求值本帧，下一次 update 会再显示一次同一帧
                        None => {
                            evaluator.evaluate_sync(frame_time, delta_seconds);
                            evaluator.swap();
                            evaluator.request(frame_time, 0.0);
                        }
                    }
                } else {
                    evaluator.swap();
                    evaluator.request(frame_time, delta_seconds);
                }
            }
        }
        Ok(())
    }

    /// 读取消费端可见的世界矩阵
    ///
    /// Buffered 模式读取前缓冲区，否则直接读取模型状态。
    pub fn with_world_matrices<R>(&self, id: ModelId, f: impl FnOnce(&[Mat4]) -> R) -> Result<R> {
        let entry = &self.models[self.position(id)?];
        match &entry.buffer {
            Some(buffer) => Ok(f(&buffer.front())),
            None => {
                self.lock.wait();
                let model = lock_model(&entry.model)?;
                Ok(f(model.world_matrices()))
            }
        }
    }

    fn evaluate_immediate(&self, frame_time: Option<f32>, delta_seconds: f32) {
        self.models.par_iter().for_each(|entry| {
            let mut model = entry.model.lock().unwrap_or_else(|e| e.into_inner());
            model.evaluate(frame_time, delta_seconds);
        });
    }

    fn apply_physics_init_request(&mut self) {
        if !self.player.take_physics_init_request() {
            return;
        }
        self.lock.wait();
        for entry in &self.models {
            let mut model = entry.model.lock().unwrap_or_else(|e| e.into_inner());
            if model.has_animation() {
                model.initialize_physics();
            }
        }
        log::debug!("[运行时] 物理重置: 帧 {:.2}", self.player.current_frame_time());
    }

    fn refresh_duration(&mut self) {
        let duration = self
            .models
            .iter()
            .map(|entry| {
                entry
                    .model
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .animation_duration()
            })
            .fold(0.0f32, f32::max);
        self.player.set_duration(duration);
    }

    fn position(&self, id: ModelId) -> Result<usize> {
        self.models
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(MmdError::InvalidModelId(id))
    }
}

impl Drop for MmdRuntime {
    fn drop(&mut self) {
        // 工作线程仍持有模型时不能提前返回
        self.lock.wait();
    }
}

fn lock_model(model: &Mutex<MmdModel>) -> Result<MutexGuard<'_, MmdModel>> {
    model.lock().map_err(|_| MmdError::LockPoisoned("model"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{BoneKeyframe, KeyframeAnimation};
    use crate::physics::{PhysicsMode, RapierPhysicsEngine, RigidBodyDescriptor, RigidBodyShape};
    use crate::skeleton::BoneMetadata;
    use glam::{Quat, Vec3};

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new(
            "miku",
            vec![
                BoneMetadata::new("センター", -1, Vec3::ZERO),
                BoneMetadata::new("上半身", 0, Vec3::new(0.0, 1.0, 0.0)),
            ],
        )
    }

    fn slide(frames: u32) -> Box<dyn ModelAnimation> {
        let mut animation = KeyframeAnimation::new("slide");
        let track = animation.bone_track_mut("センター");
        track.insert_keyframe(BoneKeyframe::new(0, Vec3::ZERO, Quat::IDENTITY));
        track.insert_keyframe(BoneKeyframe::new(frames, Vec3::new(frames as f32, 0.0, 0.0), Quat::IDENTITY));
        Box::new(animation)
    }

    fn center_x(runtime: &MmdRuntime, id: ModelId) -> f32 {
        runtime.with_world_matrices(id, |m| m[0].w_axis.x).unwrap()
    }

    #[test]
    fn test_immediate_update_evaluates_current_frame() {
        let mut runtime = MmdRuntime::default();
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.set_animation(id, Some(slide(300))).unwrap();
        assert_eq!(runtime.player().duration(), 300.0);

        runtime.play();
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_buffered_update_lags_one_frame() {
        let mut runtime = MmdRuntime::new(RuntimeConfig {
            evaluation_type: EvaluationType::Buffered,
            ..Default::default()
        });
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.set_animation(id, Some(slide(300))).unwrap();
        runtime.play();

        // 第一帧同步求值
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 30.0).abs() < 1e-3);

        // 之后的帧延迟一帧可见
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 30.0).abs() < 1e-3);
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_seek_forces_sync_evaluation_in_buffered_mode() {
        let mut runtime = MmdRuntime::default();
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.set_animation(id, Some(slide(300))).unwrap();
        runtime.set_evaluation_type(EvaluationType::Buffered);
        runtime.update(16.0).unwrap();

        runtime.seek(150.0, true).unwrap();
        runtime.update(16.0).unwrap();
        assert!((center_x(&runtime, id) - 150.0).abs() < 1e-3);
    }

    #[test]
    fn test_buffered_seek_while_playing_does_not_repeat_frame() {
        let mut runtime = MmdRuntime::new(RuntimeConfig {
            evaluation_type: EvaluationType::Buffered,
            ..Default::default()
        });
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.set_animation(id, Some(slide(300))).unwrap();
        runtime.play();
        runtime.update(1000.0).unwrap();
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 30.0).abs() < 1e-3);

        runtime.seek(150.0, false).unwrap();
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 150.0).abs() < 1e-3);

        // 跳转后的下一帧是推进后的帧，而不是再次显示 150
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 180.0).abs() < 1e-3);
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 210.0).abs() < 1e-3);
    }

    #[test]
    fn test_seek_force_evaluate_in_immediate_mode() {
        let mut runtime = MmdRuntime::default();
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.set_animation(id, Some(slide(300))).unwrap();
        runtime.seek(100.0, true).unwrap();
        assert!((center_x(&runtime, id) - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_switching_back_to_immediate_reads_model_state() {
        let mut runtime = MmdRuntime::new(RuntimeConfig {
            evaluation_type: EvaluationType::Buffered,
            ..Default::default()
        });
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.set_animation(id, Some(slide(300))).unwrap();
        runtime.play();
        runtime.update(1000.0).unwrap();
        runtime.update(1000.0).unwrap();

        runtime.set_evaluation_type(EvaluationType::Immediate);
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 90.0).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_model_id() {
        let mut runtime = MmdRuntime::default();
        let id = runtime.add_model(descriptor()).unwrap();
        runtime.remove_model(id).unwrap();
        assert!(matches!(runtime.remove_model(id), Err(MmdError::InvalidModelId(_))));
        assert!(matches!(
            runtime.with_world_matrices(id, |m| m.len()),
            Err(MmdError::InvalidModelId(_))
        ));
        assert_eq!(runtime.model_count(), 0);
    }

    #[test]
    fn test_runtime_with_rapier_physics() {
        let mut runtime = MmdRuntime::default().with_physics_engine(Arc::new(RapierPhysicsEngine));
        let mut bodies = vec![RigidBodyDescriptor::new(
            "上半身",
            1,
            RigidBodyShape::Sphere { radius: 0.5 },
            PhysicsMode::Kinematic,
        )];
        bodies[0].position = Vec3::new(0.0, 1.0, 0.0);
        let id = runtime
            .add_model(descriptor().with_physics(bodies, Vec::new()))
            .unwrap();
        assert!(runtime.model(id).unwrap().lock().unwrap().has_physics());

        runtime.set_animation(id, Some(slide(300))).unwrap();
        runtime.play();
        runtime.update(1000.0).unwrap();
        assert!((center_x(&runtime, id) - 30.0).abs() < 1e-3);
    }
}
