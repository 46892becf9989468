//! 动画系统
//!
//! - BezierCurve: 关键帧插值曲线及其缓存
//! - MotionTrack: 骨骼 / Morph / IK 关键帧轨道
//! - ModelAnimation: 模型求值时调用的动画接口

mod bezier_curve;
mod model_animation;
mod motion_track;

pub use bezier_curve::{BezierCurve, BezierCurveCache, BezierCurveFactory, Curve};
pub use model_animation::{AnimationTarget, KeyframeAnimation, ModelAnimation};
pub use motion_track::{
    BoneFrameTransform, BoneInterpolation, BoneKeyframe, BoneMotionTrack, IkKeyframe,
    IkMotionTrack, MorphKeyframe, MorphMotionTrack, MotionTrack,
};
