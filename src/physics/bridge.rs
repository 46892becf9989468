//! 刚体与骨骼的绑定
//!
//! 构建时记录刚体相对骨骼的偏移：offset = bone_world⁻¹ * body_world。
//! - 运动学：body = bone_world * offset
//! - 动态：bone = body * offset⁻¹
//! - 动态 + 骨骼对齐：旋转取自刚体，平移保持骨骼当前位置

use glam::Mat4;

use super::{PhysicsMode, RigidBodyDescriptor};
use crate::skeleton::BoneSet;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidBodyBinding {
    pub bone: Option<usize>,
    pub mode: PhysicsMode,
    offset: Mat4,
    inverse_offset: Mat4,
    /// 描述中给出的刚体世界变换
    initial_transform: Mat4,
}

impl RigidBodyBinding {
    pub fn new(descriptor: &RigidBodyDescriptor, bones: &BoneSet) -> Self {
        let initial_transform =
            Mat4::from_rotation_translation(descriptor.rotation.normalize(), descriptor.position);

        let bone = usize::try_from(descriptor.bone_index)
            .ok()
            .filter(|&b| b < bones.len());
        if bone.is_none() && descriptor.bone_index >= 0 {
            log::warn!(
                "[物理] 刚体 '{}' 的骨骼索引 {} 无效，不与骨骼同步",
                descriptor.name,
                descriptor.bone_index
            );
        }

        let offset = match bone {
            Some(b) => bones.world_matrix(b).inverse() * initial_transform,
            None => Mat4::IDENTITY,
        };

        Self {
            bone,
            mode: descriptor.physics_mode,
            offset,
            inverse_offset: offset.inverse(),
            initial_transform,
        }
    }

    #[inline]
    pub fn offset(&self) -> Mat4 {
        self.offset
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.mode != PhysicsMode::Kinematic
    }

    /// 根据骨骼当前世界矩阵计算刚体应有的世界变换
    pub fn body_transform(&self, bones: &BoneSet) -> Mat4 {
        match self.bone {
            Some(b) => bones.world_matrix(b) * self.offset,
            None => self.initial_transform,
        }
    }

    /// 根据刚体世界变换计算骨骼世界矩阵
    pub fn bone_transform(&self, body_world: Mat4, bone_world: Mat4) -> Mat4 {
        let driven = body_world * self.inverse_offset;
        match self.mode {
            PhysicsMode::DynamicWithBoneAlign => Mat4::from_cols(
                driven.x_axis,
                driven.y_axis,
                driven.z_axis,
                bone_world.w_axis,
            ),
            _ => driven,
        }
    }

    /// 动态刚体写回骨骼，运动学刚体不读回
    pub fn write_back(&self, body_world: Mat4, bones: &mut BoneSet) {
        let Some(b) = self.bone else {
            return;
        };
        if !self.is_dynamic() {
            return;
        }
        let world = self.bone_transform(body_world, bones.world_matrix(b));
        bones.set_world_matrix(b, world);
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;
    use crate::physics::RigidBodyShape;
    use crate::skeleton::BoneMetadata;

    fn bones() -> BoneSet {
        BoneSet::new(&[
            BoneMetadata::new("上半身", -1, Vec3::new(0.0, 10.0, 0.0)),
            BoneMetadata::new("髪", 0, Vec3::new(0.0, 5.0, 0.0)),
        ])
    }

    fn descriptor(bone_index: i32, mode: PhysicsMode) -> RigidBodyDescriptor {
        let mut desc = RigidBodyDescriptor::new("髪", bone_index, RigidBodyShape::Sphere { radius: 1.0 }, mode);
        desc.position = Vec3::new(0.0, 14.0, 0.0);
        desc.rotation = Quat::from_rotation_z(0.3);
        desc
    }

    #[test]
    fn test_kinematic_body_follows_bone() {
        let mut bones = bones();
        let binding = RigidBodyBinding::new(&descriptor(1, PhysicsMode::Kinematic), &bones);

        // 绑定时刚体位置保持描述值
        let body = binding.body_transform(&bones);
        assert!(body.w_axis.truncate().abs_diff_eq(Vec3::new(0.0, 14.0, 0.0), 1e-5));

        bones.get_mut(0).unwrap().animation_translation = Vec3::new(3.0, 10.0, 0.0);
        bones.update(false, &[]);
        let body = binding.body_transform(&bones);
        assert!(body.w_axis.truncate().abs_diff_eq(Vec3::new(3.0, 14.0, 0.0), 1e-5));
    }

    #[test]
    fn test_dynamic_write_back_roundtrip() {
        let mut bones = bones();
        let binding = RigidBodyBinding::new(&descriptor(1, PhysicsMode::Dynamic), &bones);
        let before = bones.world_matrix(1);

        let body = binding.body_transform(&bones);
        binding.write_back(body, &mut bones);
        assert!(bones.world_matrix(1).abs_diff_eq(before, 1e-4));

        // 刚体下落 2 个单位，骨骼随之下落
        let fallen = Mat4::from_translation(Vec3::new(0.0, -2.0, 0.0)) * body;
        binding.write_back(fallen, &mut bones);
        assert!(bones
            .world_position(1)
            .abs_diff_eq(Vec3::new(0.0, 13.0, 0.0), 1e-4));
    }

    #[test]
    fn test_bone_align_keeps_bone_translation() {
        let mut bones = bones();
        let binding = RigidBodyBinding::new(&descriptor(1, PhysicsMode::DynamicWithBoneAlign), &bones);

        let body = binding.body_transform(&bones);
        let moved = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))
            * body
            * Mat4::from_quat(Quat::from_rotation_x(0.5));
        binding.write_back(moved, &mut bones);

        assert!(bones
            .world_position(1)
            .abs_diff_eq(Vec3::new(0.0, 15.0, 0.0), 1e-4));
        let (_, rotation, _) = bones.world_matrix(1).to_scale_rotation_translation();
        assert!(rotation.angle_between(Quat::IDENTITY) > 0.1);
    }

    #[test]
    fn test_kinematic_is_never_read_back() {
        let mut bones = bones();
        let binding = RigidBodyBinding::new(&descriptor(1, PhysicsMode::Kinematic), &bones);
        let before = bones.world_matrix(1);
        binding.write_back(Mat4::from_translation(Vec3::splat(100.0)), &mut bones);
        assert_eq!(bones.world_matrix(1), before);
    }

    #[test]
    fn test_unbound_body_keeps_initial_transform() {
        let bones = bones();
        let binding = RigidBodyBinding::new(&descriptor(42, PhysicsMode::Dynamic), &bones);
        assert!(binding.bone.is_none());
        assert!(binding
            .body_transform(&bones)
            .w_axis
            .truncate()
            .abs_diff_eq(Vec3::new(0.0, 14.0, 0.0), 1e-6));
    }
}
