//! 动画轨道
//!
//! 存储单个骨骼 / Morph / IK 的所有关键帧，并按帧时间求值。
//! 帧时间可以是小数，落在两个关键帧之间时插值。

use std::collections::BTreeMap;
use std::ops::Bound;

use glam::{Quat, Vec3};

use super::bezier_curve::{BezierCurve, BezierCurveFactory, Curve};

// ============================================================================
// 关键帧
// ============================================================================

/// 骨骼关键帧插值参数（平移 X/Y/Z 与旋转各一条曲线）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoneInterpolation {
    pub translation_x: [u8; 4],
    pub translation_y: [u8; 4],
    pub translation_z: [u8; 4],
    pub rotation: [u8; 4],
}

impl Default for BoneInterpolation {
    fn default() -> Self {
        Self {
            translation_x: BezierCurve::LINEAR,
            translation_y: BezierCurve::LINEAR,
            translation_z: BezierCurve::LINEAR,
            rotation: BezierCurve::LINEAR,
        }
    }
}

/// 骨骼关键帧
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneKeyframe {
    pub frame_index: u32,
    /// 相对静止位置的平移
    pub translation: Vec3,
    pub orientation: Quat,
    /// 从上一关键帧到本关键帧的插值曲线
    pub interpolation: BoneInterpolation,
}

impl BoneKeyframe {
    pub fn new(frame_index: u32, translation: Vec3, orientation: Quat) -> Self {
        Self {
            frame_index,
            translation,
            orientation,
            interpolation: BoneInterpolation::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MorphKeyframe {
    pub frame_index: u32,
    pub weight: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IkKeyframe {
    pub frame_index: u32,
    pub enabled: bool,
}

/// 骨骼帧变换结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoneFrameTransform {
    pub translation: Vec3,
    pub orientation: Quat,
}

impl Default for BoneFrameTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            orientation: Quat::IDENTITY,
        }
    }
}

// ============================================================================
// 轨道
// ============================================================================

/// 动画轨道 trait
pub trait MotionTrack {
    type Frame;

    /// 求值指定帧时间
    fn seek(&self, frame_time: f32, bezier_factory: &dyn BezierCurveFactory) -> Self::Frame;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn max_frame_index(&self) -> u32;
}

/// 查找帧时间两侧最近的关键帧
///
/// 返回 (不晚于 frame_time 的最后一帧, 晚于 frame_time 的第一帧)
fn search_closest<K>(keyframes: &BTreeMap<u32, K>, frame_time: f32) -> (Option<&K>, Option<&K>) {
    let floor = frame_time.max(0.0).floor() as u32;
    let prev = keyframes.range(..=floor).next_back().map(|(_, k)| k);
    let next = keyframes
        .range((Bound::Excluded(floor), Bound::Unbounded))
        .next()
        .map(|(_, k)| k);
    (prev, next)
}

/// 两关键帧之间的归一化位置
#[inline]
fn coefficient(prev: u32, next: u32, frame_time: f32) -> f32 {
    if next <= prev {
        return 0.0;
    }
    ((frame_time - prev as f32) / (next - prev) as f32).clamp(0.0, 1.0)
}

/// 骨骼动画轨道
#[derive(Debug, Clone, Default)]
pub struct BoneMotionTrack {
    pub keyframes: BTreeMap<u32, BoneKeyframe>,
}

impl BoneMotionTrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入关键帧，同一帧已存在时替换并返回旧值
    pub fn insert_keyframe(&mut self, keyframe: BoneKeyframe) -> Option<BoneKeyframe> {
        self.keyframes.insert(keyframe.frame_index, keyframe)
    }

    pub fn remove_keyframe(&mut self, frame_index: u32) -> Option<BoneKeyframe> {
        self.keyframes.remove(&frame_index)
    }
}

impl MotionTrack for BoneMotionTrack {
    type Frame = BoneFrameTransform;

    fn seek(&self, frame_time: f32, bezier_factory: &dyn BezierCurveFactory) -> Self::Frame {
        match search_closest(&self.keyframes, frame_time) {
            (Some(prev), Some(next)) => {
                let interval = next.frame_index - prev.frame_index;
                let coef = coefficient(prev.frame_index, next.frame_index, frame_time);
                let curve = |parameters: [u8; 4]| {
                    bezier_factory.get_or_new(parameters, interval).value(coef)
                };

                let ip = &next.interpolation;
                let amounts = Vec3::new(
                    curve(ip.translation_x),
                    curve(ip.translation_y),
                    curve(ip.translation_z),
                );
                BoneFrameTransform {
                    translation: prev.translation + (next.translation - prev.translation) * amounts,
                    orientation: prev.orientation.slerp(next.orientation, curve(ip.rotation)),
                }
            }
            (Some(only), None) | (None, Some(only)) => BoneFrameTransform {
                translation: only.translation,
                orientation: only.orientation,
            },
            (None, None) => BoneFrameTransform::default(),
        }
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        self.keyframes.keys().next_back().copied().unwrap_or(0)
    }
}

/// Morph 动画轨道（线性插值）
#[derive(Debug, Clone, Default)]
pub struct MorphMotionTrack {
    pub keyframes: BTreeMap<u32, MorphKeyframe>,
}

impl MorphMotionTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_keyframe(&mut self, keyframe: MorphKeyframe) -> Option<MorphKeyframe> {
        self.keyframes.insert(keyframe.frame_index, keyframe)
    }

    pub fn remove_keyframe(&mut self, frame_index: u32) -> Option<MorphKeyframe> {
        self.keyframes.remove(&frame_index)
    }
}

impl MotionTrack for MorphMotionTrack {
    type Frame = f32;

    fn seek(&self, frame_time: f32, _bezier_factory: &dyn BezierCurveFactory) -> Self::Frame {
        match search_closest(&self.keyframes, frame_time) {
            (Some(prev), Some(next)) => {
                let coef = coefficient(prev.frame_index, next.frame_index, frame_time);
                prev.weight + (next.weight - prev.weight) * coef
            }
            (Some(only), None) | (None, Some(only)) => only.weight,
            (None, None) => 0.0,
        }
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        self.keyframes.keys().next_back().copied().unwrap_or(0)
    }
}

/// IK 开关轨道（阶跃，不插值）
#[derive(Debug, Clone, Default)]
pub struct IkMotionTrack {
    pub keyframes: BTreeMap<u32, IkKeyframe>,
}

impl IkMotionTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_keyframe(&mut self, keyframe: IkKeyframe) -> Option<IkKeyframe> {
        self.keyframes.insert(keyframe.frame_index, keyframe)
    }
}

impl MotionTrack for IkMotionTrack {
    type Frame = bool;

    fn seek(&self, frame_time: f32, _bezier_factory: &dyn BezierCurveFactory) -> Self::Frame {
        match search_closest(&self.keyframes, frame_time) {
            (Some(prev), _) => prev.enabled,
            (None, Some(next)) => next.enabled,
            (None, None) => true,
        }
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        self.keyframes.keys().next_back().copied().unwrap_or(0)
    }
}
