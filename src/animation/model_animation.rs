//! 模型动画
//!
//! `ModelAnimation` 是模型求值时调用的动画接口；`KeyframeAnimation`
//! 是按名称绑定到模型的关键帧实现。

use super::bezier_curve::BezierCurveCache;
use super::motion_track::{BoneMotionTrack, IkMotionTrack, MorphMotionTrack, MotionTrack};
use crate::morph::MorphController;
use crate::skeleton::BoneSet;

/// 动画写入的目标状态
pub struct AnimationTarget<'a> {
    pub bones: &'a mut BoneSet,
    pub morphs: &'a mut MorphController,
    /// 按 IK 求解器索引排列的启用状态
    pub ik_states: &'a mut [bool],
}

/// 模型动画接口
pub trait ModelAnimation: Send {
    /// 动画被设置到模型时调用，用于按名称解析索引
    fn bind(&mut self, _bones: &BoneSet, _morphs: &MorphController) {}

    /// 写入指定帧时间的骨骼姿态、Morph 权重与 IK 状态
    fn animate(&mut self, frame_time: f32, target: &mut AnimationTarget<'_>);

    /// 动画长度（帧）
    fn duration(&self) -> f32;
}

#[derive(Debug, Clone)]
struct NamedTrack<T> {
    name: String,
    track: T,
}

/// 关键帧动画
#[derive(Debug, Clone, Default)]
pub struct KeyframeAnimation {
    pub name: String,
    bone_tracks: Vec<NamedTrack<BoneMotionTrack>>,
    morph_tracks: Vec<NamedTrack<MorphMotionTrack>>,
    ik_tracks: Vec<NamedTrack<IkMotionTrack>>,
    bezier_cache: BezierCurveCache,

    bone_bindings: Vec<Option<usize>>,
    morph_bindings: Vec<Vec<usize>>,
    ik_bindings: Vec<Option<usize>>,
    bound: bool,
}

impl KeyframeAnimation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 获取或创建骨骼轨道
    pub fn bone_track_mut(&mut self, bone_name: &str) -> &mut BoneMotionTrack {
        self.bound = false;
        &mut find_or_insert(&mut self.bone_tracks, bone_name).track
    }

    /// 获取或创建 Morph 轨道
    pub fn morph_track_mut(&mut self, morph_name: &str) -> &mut MorphMotionTrack {
        self.bound = false;
        &mut find_or_insert(&mut self.morph_tracks, morph_name).track
    }

    /// 获取或创建 IK 开关轨道（以 IK 骨骼名称标识）
    pub fn ik_track_mut(&mut self, ik_bone_name: &str) -> &mut IkMotionTrack {
        self.bound = false;
        &mut find_or_insert(&mut self.ik_tracks, ik_bone_name).track
    }

    pub fn bone_track_count(&self) -> usize {
        self.bone_tracks.len()
    }

    pub fn morph_track_count(&self) -> usize {
        self.morph_tracks.len()
    }

    /// 已成功绑定的轨道数
    pub fn bound_track_count(&self) -> usize {
        self.bone_bindings.iter().filter(|b| b.is_some()).count()
            + self.morph_bindings.iter().filter(|b| !b.is_empty()).count()
            + self.ik_bindings.iter().filter(|b| b.is_some()).count()
    }
}

fn find_or_insert<'a, T: Default>(tracks: &'a mut Vec<NamedTrack<T>>, name: &str) -> &'a mut NamedTrack<T> {
    let position = match tracks.iter().position(|t| t.name == name) {
        Some(position) => position,
        None => {
            tracks.push(NamedTrack {
                name: name.to_string(),
                track: T::default(),
            });
            tracks.len() - 1
        }
    };
    &mut tracks[position]
}

impl ModelAnimation for KeyframeAnimation {
    fn bind(&mut self, bones: &BoneSet, morphs: &MorphController) {
        self.bone_bindings = self
            .bone_tracks
            .iter()
            .map(|t| {
                let index = bones.find_bone_by_name(&t.name);
                if index.is_none() {
                    log::warn!("[动画] '{}': 找不到骨骼 '{}'，轨道跳过", self.name, t.name);
                }
                index
            })
            .collect();

        self.morph_bindings = self
            .morph_tracks
            .iter()
            .map(|t| match morphs.morph_indices(&t.name) {
                Some(indices) => indices.to_vec(),
                None => {
                    log::warn!("[动画] '{}': 找不到 Morph '{}'，轨道跳过", self.name, t.name);
                    Vec::new()
                }
            })
            .collect();

        self.ik_bindings = self
            .ik_tracks
            .iter()
            .map(|t| {
                let solver = bones
                    .find_bone_by_name(&t.name)
                    .and_then(|i| bones.get(i))
                    .and_then(|bone| bone.ik_solver_index());
                if solver.is_none() {
                    log::warn!("[动画] '{}': 找不到 IK '{}'，轨道跳过", self.name, t.name);
                }
                solver
            })
            .collect();

        self.bound = true;
        log::info!(
            "[动画] '{}' 绑定完成: {}/{} 条轨道",
            self.name,
            self.bound_track_count(),
            self.bone_tracks.len() + self.morph_tracks.len() + self.ik_tracks.len()
        );
    }

    fn animate(&mut self, frame_time: f32, target: &mut AnimationTarget<'_>) {
        if !self.bound {
            log::warn!("[动画] '{}' 尚未绑定到模型", self.name);
            return;
        }

        target.bones.reset_animation();
        for (named, binding) in self.bone_tracks.iter().zip(&self.bone_bindings) {
            let Some(bone) = binding.and_then(|i| target.bones.get_mut(i)) else {
                continue;
            };
            let frame = named.track.seek(frame_time, &self.bezier_cache);
            bone.animation_translation = bone.rest_translation + frame.translation;
            bone.animation_rotation = frame.orientation;
        }

        for (named, indices) in self.morph_tracks.iter().zip(&self.morph_bindings) {
            if indices.is_empty() {
                continue;
            }
            let weight = named.track.seek(frame_time, &self.bezier_cache);
            for &index in indices {
                if let Err(e) = target.morphs.set_morph_weight_from_index(index, weight) {
                    log::warn!("[动画] '{}': {}", self.name, e);
                }
            }
        }

        for (named, binding) in self.ik_tracks.iter().zip(&self.ik_bindings) {
            let Some(state) = binding.and_then(|s| target.ik_states.get_mut(s)) else {
                continue;
            };
            *state = named.track.seek(frame_time, &self.bezier_cache);
        }
    }

    fn duration(&self) -> f32 {
        let bones = self.bone_tracks.iter().map(|t| t.track.max_frame_index());
        let morphs = self.morph_tracks.iter().map(|t| t.track.max_frame_index());
        let iks = self.ik_tracks.iter().map(|t| t.track.max_frame_index());
        bones.chain(morphs).chain(iks).max().unwrap_or(0) as f32
    }
}
