//! 骨骼节点
//!
//! `BoneMetadata` 是模型资源中不可变的骨骼描述，`RuntimeBone` 是每个模型实例中
//! 可变的骨骼状态。两者一一对应，顺序相同。

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};

use super::append_solver::AppendSolver;

// ============================================================================
// 骨骼标志
// ============================================================================

bitflags! {
    /// 骨骼标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// 可旋转
        const ROTATABLE = 1 << 0;
        /// 可移动
        const MOVABLE = 1 << 1;
        /// 是 IK 骨骼
        const IK = 1 << 2;
        /// 附加旋转
        const APPEND_ROTATE = 1 << 3;
        /// 附加平移
        const APPEND_TRANSLATE = 1 << 4;
        /// 附加变换使用本地坐标
        const APPEND_LOCAL = 1 << 5;
        /// 固定轴
        const FIXED_AXIS = 1 << 6;
        /// 本地轴
        const LOCAL_AXIS = 1 << 7;
        /// 物理后变形
        const TRANSFORM_AFTER_PHYSICS = 1 << 8;
        /// IK 启用
        const IK_ENABLED = 1 << 9;
    }
}

// ============================================================================
// 附加变换 / IK 描述
// ============================================================================

/// 附加变换（付与）描述
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AppendTransform {
    /// 附加变换父骨骼索引
    pub parent_index: i32,
    /// 附加变换比率
    pub ratio: f32,
}

/// IK 链接描述
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IkLinkDescriptor {
    /// 链接骨骼索引
    pub bone_index: i32,
    /// 欧拉角下限 (弧度)
    pub angle_min: Option<Vec3>,
    /// 欧拉角上限 (弧度)
    pub angle_max: Option<Vec3>,
}

impl IkLinkDescriptor {
    /// 无角度限制的链接
    pub fn new(bone_index: i32) -> Self {
        Self {
            bone_index,
            angle_min: None,
            angle_max: None,
        }
    }

    /// 带角度限制的链接
    pub fn with_limits(bone_index: i32, angle_min: Vec3, angle_max: Vec3) -> Self {
        Self {
            bone_index,
            angle_min: Some(angle_min),
            angle_max: Some(angle_max),
        }
    }
}

/// IK 描述
#[derive(Clone, Debug, PartialEq)]
pub struct IkDescriptor {
    /// 目标骨骼索引（末端效应器）
    pub target_index: i32,
    /// 迭代次数
    pub iterations: u32,
    /// 单次迭代角度限制
    pub angle_limit: f32,
    /// IK 链接列表，从靠近末端的骨骼开始
    pub links: Vec<IkLinkDescriptor>,
}

// ============================================================================
// 骨骼元数据
// ============================================================================

/// 骨骼元数据（来自模型资源，加载后不变）
#[derive(Clone, Debug)]
pub struct BoneMetadata {
    /// 骨骼名称
    pub name: String,
    /// 静止姿态下相对于父骨骼的平移
    pub rest_translation: Vec3,
    /// 逆绑定矩阵（用于蒙皮）
    pub inverse_bind_matrix: Mat4,
    /// 父骨骼索引 (-1 表示根骨骼)
    pub parent_index: i32,
    /// 变换顺序，不要求连续
    pub transform_order: i32,
    /// 骨骼标志
    pub flags: BoneFlags,
    /// 附加变换
    pub append_transform: Option<AppendTransform>,
    /// IK
    pub ik: Option<IkDescriptor>,
}

impl BoneMetadata {
    pub fn new(name: impl Into<String>, parent_index: i32, rest_translation: Vec3) -> Self {
        Self {
            name: name.into(),
            rest_translation,
            inverse_bind_matrix: Mat4::IDENTITY,
            parent_index,
            transform_order: 0,
            flags: BoneFlags::ROTATABLE,
            append_transform: None,
            ik: None,
        }
    }

    #[inline]
    pub fn transform_after_physics(&self) -> bool {
        self.flags.contains(BoneFlags::TRANSFORM_AFTER_PHYSICS)
    }
}

// ============================================================================
// 运行时骨骼
// ============================================================================

/// 运行时骨骼
///
/// 静态部分在构建时从 `BoneMetadata` 复制；动态部分每帧由动画、Morph 与求解器写入。
/// 世界矩阵不在这里，而是保存在 `BoneSet` 的连续缓冲区中，以便整体交换。
#[derive(Clone, Debug)]
pub struct RuntimeBone {
    // ========================================
    // 静态数据（初始化后不变）
    // ========================================

    /// 骨骼名称
    pub name: String,

    /// 骨骼索引
    pub(crate) index: usize,

    /// 父骨骼
    pub(crate) parent: Option<usize>,

    /// 子骨骼
    pub(crate) children: Vec<usize>,

    /// 变换顺序
    pub transform_order: i32,

    /// 骨骼标志
    pub flags: BoneFlags,

    /// 静止平移
    pub rest_translation: Vec3,

    /// 逆绑定矩阵
    pub inverse_bind_matrix: Mat4,

    /// 附加变换求解器索引
    pub(crate) append_solver: Option<usize>,

    /// IK 求解器索引（同时是 IK 启用状态数组的下标）
    pub(crate) ik_solver: Option<usize>,

    // ========================================
    // 动态数据（每帧更新）
    // ========================================

    /// 动画平移（绝对值，默认等于静止平移）
    pub animation_translation: Vec3,

    /// 动画旋转
    pub animation_rotation: Quat,

    /// 动画缩放
    pub animation_scale: Vec3,

    /// Morph 平移偏移，`None` 表示未受 Morph 影响
    pub morph_position_offset: Option<Vec3>,

    /// Morph 旋转偏移
    pub morph_rotation_offset: Option<Quat>,

    /// IK 旋转
    pub ik_rotation: Option<Quat>,

    /// 本地变换矩阵
    pub(crate) local_matrix: Mat4,
}

impl RuntimeBone {
    pub(crate) fn from_metadata(index: usize, metadata: &BoneMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
            index,
            parent: None,
            children: Vec::new(),
            transform_order: metadata.transform_order,
            flags: metadata.flags,
            rest_translation: metadata.rest_translation,
            inverse_bind_matrix: metadata.inverse_bind_matrix,
            append_solver: None,
            ik_solver: None,
            animation_translation: metadata.rest_translation,
            animation_rotation: Quat::IDENTITY,
            animation_scale: Vec3::ONE,
            morph_position_offset: None,
            morph_rotation_offset: None,
            ik_rotation: None,
            local_matrix: Mat4::from_translation(metadata.rest_translation),
        }
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[inline]
    pub fn append_solver_index(&self) -> Option<usize> {
        self.append_solver
    }

    #[inline]
    pub fn ik_solver_index(&self) -> Option<usize> {
        self.ik_solver
    }

    #[inline]
    pub fn local_matrix(&self) -> Mat4 {
        self.local_matrix
    }

    #[inline]
    pub fn transform_after_physics(&self) -> bool {
        self.flags.contains(BoneFlags::TRANSFORM_AFTER_PHYSICS)
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 动画平移 + Morph 偏移
    #[inline]
    pub fn animated_translation(&self) -> Vec3 {
        match self.morph_position_offset {
            Some(offset) => self.animation_translation + offset,
            None => self.animation_translation,
        }
    }

    /// 动画旋转 * Morph 偏移
    #[inline]
    pub fn animated_rotation(&self) -> Quat {
        match self.morph_rotation_offset {
            Some(offset) => self.animation_rotation * offset,
            None => self.animation_rotation,
        }
    }

    /// 相对静止姿态的平移偏移
    #[inline]
    pub fn animation_position_offset(&self) -> Vec3 {
        self.animated_translation() - self.rest_translation
    }

    /// 重置动画状态
    pub fn reset_animation(&mut self) {
        self.animation_translation = self.rest_translation;
        self.animation_rotation = Quat::IDENTITY;
        self.animation_scale = Vec3::ONE;
    }

    /// 计算本地变换
    ///
    /// 变换顺序：
    /// 1. 平移 = 动画平移 + Morph 偏移 + 附加平移
    /// 2. 旋转 = IK 旋转 * 动画旋转 * Morph 偏移 * 附加旋转
    pub(crate) fn compute_local_matrix(&mut self, append: Option<&AppendSolver>) {
        let mut rotation = self.animated_rotation();
        if let Some(ik_rotation) = self.ik_rotation {
            rotation = ik_rotation * rotation;
        }

        let mut translation = self.animated_translation();
        if let Some(append) = append {
            if append.affect_rotation {
                rotation *= append.rotation_offset;
            }
            if append.affect_position {
                translation += append.position_offset;
            }
        }

        self.local_matrix =
            Mat4::from_scale_rotation_translation(self.animation_scale, rotation, translation);
    }
}
