//! 材质代理
//!
//! Morph 控制器只通过 `MaterialProxy` 访问材质：每帧先重置为初始值，
//! 再应用所有活动 Morph，最后调用一次 `apply_changes` 提交。

use glam::{Vec3, Vec4};

/// 可被 Morph 修改的材质通道
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialChannels {
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub shininess: f32,
    pub ambient: Vec3,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_color: Vec4,
    pub sphere_texture_color: Vec4,
    pub toon_texture_color: Vec4,
}

impl Default for MaterialChannels {
    fn default() -> Self {
        Self {
            diffuse: Vec4::ONE,
            specular: Vec3::ZERO,
            shininess: 0.0,
            ambient: Vec3::ZERO,
            edge_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            edge_size: 1.0,
            texture_color: Vec4::ONE,
            sphere_texture_color: Vec4::ONE,
            toon_texture_color: Vec4::ONE,
        }
    }
}

impl MaterialChannels {
    /// 乘算恒等值（全部为 1）
    pub fn multiply_identity() -> Self {
        Self {
            diffuse: Vec4::ONE,
            specular: Vec3::ONE,
            shininess: 1.0,
            ambient: Vec3::ONE,
            edge_color: Vec4::ONE,
            edge_size: 1.0,
            texture_color: Vec4::ONE,
            sphere_texture_color: Vec4::ONE,
            toon_texture_color: Vec4::ONE,
        }
    }

    /// 加算恒等值（全部为 0）
    pub fn add_identity() -> Self {
        Self {
            diffuse: Vec4::ZERO,
            specular: Vec3::ZERO,
            shininess: 0.0,
            ambient: Vec3::ZERO,
            edge_color: Vec4::ZERO,
            edge_size: 0.0,
            texture_color: Vec4::ZERO,
            sphere_texture_color: Vec4::ZERO,
            toon_texture_color: Vec4::ZERO,
        }
    }
}

/// 材质代理接口
pub trait MaterialProxy: Send {
    /// 恢复为构建时记录的初始值
    fn reset(&mut self);

    /// 把当前通道值提交给材质系统
    fn apply_changes(&mut self);

    fn channels(&self) -> &MaterialChannels;

    fn channels_mut(&mut self) -> &mut MaterialChannels;
}

/// 标准材质代理
///
/// 保存初始值、当前值与最近一次提交的值。渲染端读取 `committed()`。
#[derive(Clone, Debug)]
pub struct StandardMaterialProxy {
    initial: MaterialChannels,
    current: MaterialChannels,
    committed: MaterialChannels,
    /// 每次提交递增
    revision: u64,
}

impl StandardMaterialProxy {
    pub fn new(initial: MaterialChannels) -> Self {
        Self {
            initial,
            current: initial,
            committed: initial,
            revision: 0,
        }
    }

    #[inline]
    pub fn initial(&self) -> &MaterialChannels {
        &self.initial
    }

    #[inline]
    pub fn committed(&self) -> &MaterialChannels {
        &self.committed
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 漫反射透明度为 0 时材质不可见
    #[inline]
    pub fn is_visible(&self) -> bool {
        self.committed.diffuse.w > 0.0
    }
}

impl MaterialProxy for StandardMaterialProxy {
    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn apply_changes(&mut self) {
        self.committed = self.current;
        self.revision += 1;
    }

    #[inline]
    fn channels(&self) -> &MaterialChannels {
        &self.current
    }

    #[inline]
    fn channels_mut(&mut self) -> &mut MaterialChannels {
        &mut self.current
    }
}
