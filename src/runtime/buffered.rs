//! 双缓冲求值
//!
//! 前缓冲区是消费端当前读取的世界矩阵，后缓冲区由工作线程写入。
//! 工作线程求值期间持有自旋锁；消费端交换前必须先 `wait`，
//! 所以交换时后缓冲区总是完整的一帧。

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use glam::Mat4;
use rayon::prelude::*;

use super::spinlock::Spinlock;
use crate::model::MmdModel;

/// 单个模型的前 / 后世界矩阵缓冲区
#[derive(Debug, Default)]
pub struct WorldMatrixBuffer {
    front: RwLock<Vec<Mat4>>,
    back: Mutex<Vec<Mat4>>,
}

impl WorldMatrixBuffer {
    /// 两个缓冲区都以当前矩阵初始化
    pub fn new(initial: &[Mat4]) -> Self {
        Self {
            front: RwLock::new(initial.to_vec()),
            back: Mutex::new(initial.to_vec()),
        }
    }

    /// 工作线程写入后缓冲区
    pub fn write_back(&self, matrices: &[Mat4]) {
        let mut back = self.back.lock().unwrap_or_else(|e| e.into_inner());
        back.clear();
        back.extend_from_slice(matrices);
    }

    /// 交换前后缓冲区，调用方必须保证工作线程已经结束
    pub fn swap(&self) {
        let mut front = self.front.write().unwrap_or_else(|e| e.into_inner());
        let mut back = self.back.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::swap(&mut *front, &mut *back);
    }

    /// 读取前缓冲区
    pub fn front(&self) -> RwLockReadGuard<'_, Vec<Mat4>> {
        self.front.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// 参与缓冲求值的模型
#[derive(Clone)]
pub(crate) struct BufferedModel {
    pub model: Arc<Mutex<MmdModel>>,
    pub buffer: Arc<WorldMatrixBuffer>,
}

/// 在 rayon 线程池上异步求值下一帧
pub struct BufferedEvaluator {
    lock: Arc<Spinlock>,
    models: Vec<BufferedModel>,
    /// 最近一次请求的帧时间
    last_requested: Option<f32>,
}

impl BufferedEvaluator {
    pub fn new(lock: Arc<Spinlock>) -> Self {
        Self {
            lock,
            models: Vec::new(),
            last_requested: None,
        }
    }

    #[inline]
    pub fn lock(&self) -> &Arc<Spinlock> {
        &self.lock
    }

    #[inline]
    pub fn last_requested(&self) -> Option<f32> {
        self.last_requested
    }

    /// 改写最近一次请求的帧时间，下一次同步求值从该帧开始
    pub fn set_last_requested(&mut self, frame_time: Option<f32>) {
        self.last_requested = frame_time;
    }

    /// 加入模型并分配缓冲区
    pub fn attach(&mut self, model: Arc<Mutex<MmdModel>>) -> Arc<WorldMatrixBuffer> {
        self.lock.wait();
        let buffer = {
            let guard = model.lock().unwrap_or_else(|e| e.into_inner());
            Arc::new(WorldMatrixBuffer::new(guard.world_matrices()))
        };
        self.models.push(BufferedModel {
            model,
            buffer: buffer.clone(),
        });
        buffer
    }

    /// 移除模型
    pub fn detach(&mut self, model: &Arc<Mutex<MmdModel>>) {
        self.lock.wait();
        self.models.retain(|m| !Arc::ptr_eq(&m.model, model));
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// 同步求值到后缓冲区，用于新模型或跳转后的第一帧
    pub fn evaluate_sync(&mut self, frame_time: Option<f32>, delta_seconds: f32) {
        self.lock.wait();
        evaluate_into_back(&self.models, frame_time, delta_seconds);
    }

    /// 请求异步求值，不阻塞调用方
    pub fn request(&mut self, frame_time: Option<f32>, delta_seconds: f32) {
        self.lock.acquire();
        self.last_requested = frame_time;

        let lock = self.lock.clone();
        let models = self.models.clone();
        rayon::spawn(move || {
            evaluate_into_back(&models, frame_time, delta_seconds);
            lock.release();
        });
    }

    /// 等待工作线程结束后交换所有模型的缓冲区
    pub fn swap(&mut self) {
        self.lock.wait();
        for model in &self.models {
            model.buffer.swap();
        }
    }

    /// 退出缓冲模式前调用，之后直接读取模型状态
    pub fn finish(&mut self) {
        self.lock.wait();
        self.last_requested = None;
    }
}

fn evaluate_into_back(models: &[BufferedModel], frame_time: Option<f32>, delta_seconds: f32) {
    models.par_iter().for_each(|m| {
        let mut model = m.model.lock().unwrap_or_else(|e| e.into_inner());
        model.evaluate(frame_time, delta_seconds);
        m.buffer.write_back(model.world_matrices());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{BoneKeyframe, KeyframeAnimation};
    use crate::model::ModelDescriptor;
    use crate::skeleton::BoneMetadata;
    use glam::{Quat, Vec3};

    fn moving_model() -> Arc<Mutex<MmdModel>> {
        let bones = vec![
            BoneMetadata::new("センター", -1, Vec3::ZERO),
            BoneMetadata::new("上半身", 0, Vec3::new(0.0, 1.0, 0.0)),
        ];
        let mut model = MmdModel::new(ModelDescriptor::new("miku", bones), None).unwrap();
        let mut animation = KeyframeAnimation::new("slide");
        let track = animation.bone_track_mut("センター");
        track.insert_keyframe(BoneKeyframe::new(0, Vec3::ZERO, Quat::IDENTITY));
        track.insert_keyframe(BoneKeyframe::new(100, Vec3::new(100.0, 0.0, 0.0), Quat::IDENTITY));
        model.set_animation(Some(Box::new(animation)));
        Arc::new(Mutex::new(model))
    }

    fn x_of(matrices: &[Mat4], bone: usize) -> f32 {
        matrices[bone].w_axis.x
    }

    #[test]
    fn test_front_holds_previous_frame_until_swap() {
        let model = moving_model();
        let mut evaluator = BufferedEvaluator::new(Arc::new(Spinlock::new()));
        let buffer = evaluator.attach(model.clone());

        evaluator.evaluate_sync(Some(10.0), 0.0);
        evaluator.swap();
        assert!((x_of(&buffer.front(), 1) - 10.0).abs() < 1e-3);

        evaluator.request(Some(20.0), 0.0);
        // 工作线程运行期间前缓冲区仍是上一帧
        assert!((x_of(&buffer.front(), 1) - 10.0).abs() < 1e-3);
        evaluator.lock().wait();
        assert!((x_of(&buffer.front(), 1) - 10.0).abs() < 1e-3);

        evaluator.swap();
        let front = buffer.front();
        assert!((x_of(&front, 0) - 20.0).abs() < 1e-3);
        assert!((x_of(&front, 1) - 20.0).abs() < 1e-3);
        assert_eq!(evaluator.last_requested(), Some(20.0));
    }

    #[test]
    fn test_detach_removes_model() {
        let model = moving_model();
        let mut evaluator = BufferedEvaluator::new(Arc::new(Spinlock::new()));
        evaluator.attach(model.clone());
        assert_eq!(evaluator.model_count(), 1);
        evaluator.detach(&model);
        assert_eq!(evaluator.model_count(), 0);
    }

    #[test]
    fn test_swap_exchanges_buffers() {
        let buffer = WorldMatrixBuffer::new(&[Mat4::IDENTITY]);
        buffer.write_back(&[Mat4::from_translation(Vec3::X)]);
        assert_eq!(buffer.front()[0], Mat4::IDENTITY);
        buffer.swap();
        assert_eq!(buffer.front()[0], Mat4::from_translation(Vec3::X));
    }
}
