//! 骨骼集合 - 管理骨骼层次结构
//!
//! 所有骨骼存放在一个连续数组中，父子关系与求解器引用都以索引表示。
//! 世界矩阵保存在独立缓冲区 `world_matrices` 中，与骨骼一一对应。

use glam::{Mat4, Vec3};

use super::append_solver::AppendSolver;
use super::bone_link::{BoneFlags, BoneMetadata, RuntimeBone};
use super::ik_solver::IkSolver;

/// 骨骼集合
#[derive(Clone, Debug)]
pub struct BoneSet {
    bones: Vec<RuntimeBone>,
    world_matrices: Vec<Mat4>,
    /// 按 transform order 稳定排序的骨骼索引
    sorted: Vec<usize>,
    /// `sorted` 中的根骨骼
    sorted_roots: Vec<usize>,
    append_solvers: Vec<AppendSolver>,
    ik_solvers: Vec<IkSolver>,
    /// 世界矩阵更新用的栈（复用内存）
    stack: Vec<usize>,
}

impl BoneSet {
    /// 从元数据构建骨骼集合
    ///
    /// 非法的父骨骼、附加变换、IK 索引只记录错误并禁用对应功能，不会使构建失败。
    pub fn new(metadata: &[BoneMetadata]) -> Self {
        let mut bones: Vec<RuntimeBone> = metadata
            .iter()
            .enumerate()
            .map(|(i, meta)| RuntimeBone::from_metadata(i, meta))
            .collect();
        let count = bones.len();

        // 第一步：连接父子关系
        for (i, meta) in metadata.iter().enumerate() {
            let parent_index = meta.parent_index;
            if parent_index < 0 {
                continue;
            }
            let parent = parent_index as usize;
            if parent >= count || parent == i || Self::is_ancestor(&bones, parent, i) {
                log::error!(
                    "[骨骼] '{}' 的父骨骼索引 {} 非法，作为根骨骼处理",
                    meta.name, parent_index
                );
                continue;
            }
            bones[i].parent = Some(parent);
            bones[parent].children.push(i);
        }

        // 第二步：附加变换求解器
        let mut append_solvers = Vec::new();
        for (i, meta) in metadata.iter().enumerate() {
            let Some(append) = meta.append_transform else {
                continue;
            };
            if !meta.flags.intersects(BoneFlags::APPEND_ROTATE | BoneFlags::APPEND_TRANSLATE) {
                continue;
            }
            let target = append.parent_index;
            if target < 0 || target as usize >= count || target as usize == i {
                log::error!(
                    "[骨骼] '{}' 的附加变换父骨骼索引 {} 非法，忽略附加变换",
                    meta.name, target
                );
                continue;
            }
            bones[i].append_solver = Some(append_solvers.len());
            append_solvers.push(AppendSolver::new(i, target as usize, meta.flags, append.ratio));
        }

        // 第三步：IK 求解器
        let mut ik_solvers = Vec::new();
        for (i, meta) in metadata.iter().enumerate() {
            let Some(ref ik) = meta.ik else {
                continue;
            };
            let solver_index = ik_solvers.len();
            let solver = IkSolver::new(solver_index, i, ik, count);
            if !solver.enabled {
                log::error!("[骨骼] '{}' 的 IK 目标或链接索引非法，禁用该 IK", meta.name);
            }
            bones[i].ik_solver = Some(solver_index);
            ik_solvers.push(solver);
        }

        // 第四步：排序
        let mut sorted: Vec<usize> = (0..count).collect();
        sorted.sort_by_key(|&i| bones[i].transform_order);
        let sorted_roots = sorted
            .iter()
            .copied()
            .filter(|&i| bones[i].parent.is_none())
            .collect();

        log::info!(
            "[骨骼] 构建完成: {} 骨骼, {} 附加变换, {} IK",
            count,
            append_solvers.len(),
            ik_solvers.len()
        );

        let mut bone_set = Self {
            bones,
            world_matrices: vec![Mat4::IDENTITY; count],
            sorted,
            sorted_roots,
            append_solvers,
            ik_solvers,
            stack: Vec::with_capacity(count),
        };
        bone_set.update_rest_pose();
        bone_set
    }

    /// `ancestor` 是否为 `bone` 的祖先（含自身）
    fn is_ancestor(bones: &[RuntimeBone], bone: usize, ancestor: usize) -> bool {
        let mut current = Some(bone);
        let mut steps = 0;
        while let Some(index) = current {
            if index == ancestor {
                return true;
            }
            steps += 1;
            if steps > bones.len() {
                return true;
            }
            current = bones[index].parent;
        }
        false
    }

    /// 计算静止姿态下的世界矩阵
    fn update_rest_pose(&mut self) {
        for i in 0..self.bones.len() {
            self.update_local_matrix(i);
        }
        for k in 0..self.sorted_roots.len() {
            let root = self.sorted_roots[k];
            self.update_world_matrix(root);
        }
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    #[inline]
    pub fn bones(&self) -> &[RuntimeBone] {
        &self.bones
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&RuntimeBone> {
        self.bones.get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut RuntimeBone> {
        self.bones.get_mut(index)
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|b| b.name == name)
    }

    /// 按 transform order 排序后的骨骼索引
    #[inline]
    pub fn sorted_indices(&self) -> &[usize] {
        &self.sorted
    }

    #[inline]
    pub fn sorted_root_indices(&self) -> &[usize] {
        &self.sorted_roots
    }

    #[inline]
    pub fn append_solvers(&self) -> &[AppendSolver] {
        &self.append_solvers
    }

    #[inline]
    pub fn ik_solvers(&self) -> &[IkSolver] {
        &self.ik_solvers
    }

    #[inline]
    pub fn ik_solver_count(&self) -> usize {
        self.ik_solvers.len()
    }

    #[inline]
    pub fn world_matrix(&self, index: usize) -> Mat4 {
        self.world_matrices[index]
    }

    #[inline]
    pub fn world_matrices(&self) -> &[Mat4] {
        &self.world_matrices
    }

    #[inline]
    pub fn world_position(&self, index: usize) -> Vec3 {
        self.world_matrices[index].w_axis.truncate()
    }

    /// 蒙皮矩阵 = 世界矩阵 * 逆绑定矩阵
    pub fn skinning_matrices(&self, out: &mut Vec<Mat4>) {
        out.clear();
        out.extend(
            self.bones
                .iter()
                .zip(&self.world_matrices)
                .map(|(bone, world)| *world * bone.inverse_bind_matrix),
        );
    }

    /// 重置所有骨骼的动画状态
    pub fn reset_animation(&mut self) {
        for bone in &mut self.bones {
            bone.reset_animation();
        }
    }

    /// 清除 IK 链上残留的 IK 旋转
    pub fn clear_ik_rotations(&mut self, solver_index: usize) {
        let Some(solver) = self.ik_solvers.get(solver_index) else {
            return;
        };
        for &bone in solver.chain_bones() {
            self.bones[bone].ik_rotation = None;
        }
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 更新单个骨骼的本地矩阵
    #[inline]
    pub fn update_local_matrix(&mut self, index: usize) {
        let append = self.bones[index]
            .append_solver
            .map(|solver| &self.append_solvers[solver]);
        self.bones[index].compute_local_matrix(append);
    }

    /// 从指定骨骼开始向下更新世界矩阵
    ///
    /// world = parent.world * local，根骨骼 world = local。
    pub fn update_world_matrix(&mut self, root: usize) {
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();
        stack.push(root);
        while let Some(index) = stack.pop() {
            let bone = &self.bones[index];
            self.world_matrices[index] = match bone.parent {
                Some(parent) => self.world_matrices[parent] * bone.local_matrix,
                None => bone.local_matrix,
            };
            stack.extend_from_slice(&bone.children);
        }
        self.stack = stack;
    }

    /// 直接写入世界矩阵，并反解本地矩阵
    ///
    /// 用于物理同步：刚体结果写回骨骼后，子骨骼仍然可以基于本地矩阵更新。
    pub fn set_world_matrix(&mut self, index: usize, world: Mat4) {
        self.world_matrices[index] = world;
        let local = match self.bones[index].parent {
            Some(parent) => self.world_matrices[parent].inverse() * world,
            None => world,
        };
        self.bones[index].local_matrix = local;
    }

    /// 运行附加变换求解器
    pub fn solve_append(&mut self, solver_index: usize) {
        let (rotation, position) =
            self.append_solvers[solver_index].compute(&self.bones, &self.append_solvers);
        let solver = &mut self.append_solvers[solver_index];
        solver.rotation_offset = rotation;
        solver.position_offset = position;
    }

    /// 运行 IK 求解器（被禁用的求解器不修改任何骨骼）
    pub fn solve_ik(&mut self, solver_index: usize) {
        let mut solvers = std::mem::take(&mut self.ik_solvers);
        if let Some(solver) = solvers.get_mut(solver_index) {
            solver.solve(self);
        }
        self.ik_solvers = solvers;
    }

    /// 单个物理阶段的骨骼更新
    ///
    /// 只处理 `transform_after_physics == after_physics` 的骨骼：
    /// 1. 按顺序更新本地矩阵
    /// 2. 根骨骼更新世界矩阵
    /// 3. 按顺序运行附加变换（之后更新本地与世界矩阵），再运行 IK（之后更新世界矩阵）
    /// 4. 根骨骼再次更新世界矩阵，把 IK 修正传递给子骨骼
    ///
    /// `ik_states` 以 IK 求解器索引为下标，缺省视为启用。
    pub fn update(&mut self, after_physics: bool, ik_states: &[bool]) {
        for k in 0..self.sorted.len() {
            let index = self.sorted[k];
            if self.bones[index].transform_after_physics() != after_physics {
                continue;
            }
            self.update_local_matrix(index);
        }

        self.update_roots(after_physics);

        for k in 0..self.sorted.len() {
            let index = self.sorted[k];
            if self.bones[index].transform_after_physics() != after_physics {
                continue;
            }

            if let Some(solver) = self.bones[index].append_solver {
                self.solve_append(solver);
                self.update_local_matrix(index);
                self.update_world_matrix(index);
            }

            if let Some(solver) = self.bones[index].ik_solver {
                if ik_states.get(solver).copied().unwrap_or(true) {
                    self.solve_ik(solver);
                    self.update_world_matrix(index);
                }
            }
        }

        self.update_roots(after_physics);
    }

    fn update_roots(&mut self, after_physics: bool) {
        for k in 0..self.sorted_roots.len() {
            let root = self.sorted_roots[k];
            if self.bones[root].transform_after_physics() != after_physics {
                continue;
            }
            self.update_world_matrix(root);
        }
    }
}
