//! Morph 控制器
//!
//! 权重按 Morph 索引稠密存储，名称到索引的映射允许同名 Morph。
//! 每帧只处理活动名称：先全部重置，再全部应用，权重归零的名称在应用后移出活动集合。

use std::collections::HashMap;

use glam::{Quat, Vec3};

use super::{MaterialProxy, MorphData, RuntimeMorph};
use crate::skeleton::BoneSet;
use crate::{MmdError, Result};

/// Morph 控制器
pub struct MorphController {
    morphs: Vec<RuntimeMorph>,
    weights: Vec<f32>,
    materials: Vec<Box<dyn MaterialProxy>>,

    /// 去重后的名称表
    names: Vec<String>,
    name_lookup: HashMap<String, usize>,
    /// 名称 id -> Morph 索引
    name_indices: Vec<Vec<usize>>,
    /// Morph 索引 -> 名称 id
    morph_name_ids: Vec<usize>,

    /// 活动名称（按加入顺序）
    active: Vec<usize>,
    is_active: Vec<bool>,

    /// 本帧被修改过的材质
    touched_materials: Vec<usize>,
    is_touched: Vec<bool>,

    /// Morph 索引 -> 展开后的 (叶子索引, 比率)
    flattened: Vec<Vec<(usize, f32)>>,
}

impl MorphController {
    /// 创建控制器
    ///
    /// 并行数组长度不一致时返回错误；组 Morph 中的循环引用会被切断并记录警告。
    pub fn new(
        mut morphs: Vec<RuntimeMorph>,
        materials: Vec<Box<dyn MaterialProxy>>,
        bone_count: usize,
    ) -> Result<Self> {
        for morph in &morphs {
            morph.validate()?;
        }

        let severed = sever_group_cycles(&mut morphs);
        if severed > 0 {
            log::warn!("[Morph] 切断了 {} 条循环组 Morph 引用", severed);
        }
        warn_unbound_targets(&morphs, materials.len(), bone_count);
        let flattened = flatten_groups(&morphs);

        let mut names = Vec::new();
        let mut name_lookup = HashMap::new();
        let mut name_indices: Vec<Vec<usize>> = Vec::new();
        let mut morph_name_ids = Vec::with_capacity(morphs.len());
        for (i, morph) in morphs.iter().enumerate() {
            let id = *name_lookup.entry(morph.name.clone()).or_insert_with(|| {
                names.push(morph.name.clone());
                name_indices.push(Vec::new());
                names.len() - 1
            });
            name_indices[id].push(i);
            morph_name_ids.push(id);
        }

        log::info!(
            "[Morph] 控制器创建: {} 个 Morph, {} 个名称, {} 个材质",
            morphs.len(),
            names.len(),
            materials.len()
        );

        let morph_count = morphs.len();
        let material_count = materials.len();
        let name_count = names.len();
        Ok(Self {
            morphs,
            weights: vec![0.0; morph_count],
            materials,
            names,
            name_lookup,
            name_indices,
            morph_name_ids,
            active: Vec::new(),
            is_active: vec![false; name_count],
            touched_materials: Vec::new(),
            is_touched: vec![false; material_count],
            flattened,
        })
    }

    // ========================================================================
    // 查询
    // ========================================================================

    #[inline]
    pub fn morphs(&self) -> &[RuntimeMorph] {
        &self.morphs
    }

    #[inline]
    pub fn morph_count(&self) -> usize {
        self.morphs.len()
    }

    #[inline]
    pub fn morph_weights(&self) -> &[f32] {
        &self.weights
    }

    #[inline]
    pub fn materials(&self) -> &[Box<dyn MaterialProxy>] {
        &self.materials
    }

    pub fn material_mut(&mut self, index: usize) -> Option<&mut (dyn MaterialProxy + 'static)> {
        self.materials.get_mut(index).map(|m| m.as_mut())
    }

    /// 名称对应的所有 Morph 索引
    pub fn morph_indices(&self, name: &str) -> Option<&[usize]> {
        self.name_lookup
            .get(name)
            .map(|&id| self.name_indices[id].as_slice())
    }

    /// 第一个匹配名称的 Morph 索引
    pub fn find_morph_by_name(&self, name: &str) -> Option<usize> {
        self.morph_indices(name).and_then(|indices| indices.first().copied())
    }

    /// 名称对应的第一个 Morph 的权重，未知名称返回 0
    pub fn get_morph_weight(&self, name: &str) -> f32 {
        self.find_morph_by_name(name)
            .map(|i| self.weights[i])
            .unwrap_or(0.0)
    }

    pub fn get_morph_weight_from_index(&self, index: usize) -> Option<f32> {
        self.weights.get(index).copied()
    }

    // ========================================================================
    // 权重设置
    // ========================================================================

    /// 设置同名的所有 Morph 的权重，未知名称被忽略
    pub fn set_morph_weight(&mut self, name: &str, weight: f32) {
        let Some(&id) = self.name_lookup.get(name) else {
            return;
        };
        for &i in &self.name_indices[id] {
            self.weights[i] = weight;
        }
        if weight != 0.0 {
            self.activate(id);
        }
    }

    /// 按索引设置权重
    pub fn set_morph_weight_from_index(&mut self, index: usize, weight: f32) -> Result<()> {
        let Some(slot) = self.weights.get_mut(index) else {
            return Err(MmdError::InvalidMorphIndex(index));
        };
        *slot = weight;
        if weight != 0.0 {
            self.activate(self.morph_name_ids[index]);
        }
        Ok(())
    }

    /// 所有权重归零，下一次 update 会把活动 Morph 恢复到初始状态
    pub fn reset_morph_weights(&mut self) {
        self.weights.fill(0.0);
    }

    fn activate(&mut self, id: usize) {
        if !self.is_active[id] {
            self.is_active[id] = true;
            self.active.push(id);
        }
    }

    /// 当前活动的名称
    pub fn active_morph_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.active.iter().map(|&id| self.names[id].as_str())
    }

    // ========================================================================
    // 每帧更新
    // ========================================================================

    /// 重置并重新应用所有活动 Morph，然后对每个被修改的材质提交一次
    pub fn update(&mut self, bones: &mut BoneSet) {
        for &id in &self.active {
            for &i in &self.name_indices[id] {
                reset_morph(&self.morphs, &self.flattened[i], bones, &mut self.materials);
            }
        }

        for &id in &self.active {
            let mut all_zero = true;
            for &i in &self.name_indices[id] {
                let weight = self.weights[i];
                if weight != 0.0 {
                    all_zero = false;
                }
                apply_morph(
                    &self.morphs,
                    &self.flattened[i],
                    weight,
                    bones,
                    &mut self.materials,
                    &mut self.touched_materials,
                    &mut self.is_touched,
                );
            }
            if all_zero {
                self.is_active[id] = false;
            }
        }
        let is_active = &self.is_active;
        self.active.retain(|&id| is_active[id]);

        for &m in &self.touched_materials {
            self.materials[m].apply_changes();
            self.is_touched[m] = false;
        }
        self.touched_materials.clear();
    }
}

// ============================================================================
// 组 Morph 展开
// ============================================================================

/// 预先展开每个 Morph 的 (叶子 Morph 索引, 累计比率) 列表
///
/// 叶子 Morph 展开为自身。经多条路径到达同一叶子时比率相加，
/// 所以共享子组的图也只展开一次。必须在切断循环之后调用。
fn flatten_groups(morphs: &[RuntimeMorph]) -> Vec<Vec<(usize, f32)>> {
    fn visit(morphs: &[RuntimeMorph], index: usize, leaves: &mut [Option<Vec<(usize, f32)>>]) {
        if leaves[index].is_some() {
            return;
        }
        let MorphData::Group { indices, ratios } = &morphs[index].data else {
            leaves[index] = Some(vec![(index, 1.0)]);
            return;
        };
        leaves[index] = Some(Vec::new());

        let mut flattened: Vec<(usize, f32)> = Vec::new();
        for (&child, &ratio) in indices.iter().zip(ratios) {
            if child < 0 || child as usize >= morphs.len() {
                continue;
            }
            let child = child as usize;
            visit(morphs, child, leaves);
            let Some(child_leaves) = &leaves[child] else {
                continue;
            };
            for &(leaf, child_ratio) in child_leaves {
                let ratio = ratio * child_ratio;
                match flattened.iter_mut().find(|(l, _)| *l == leaf) {
                    Some(entry) => entry.1 += ratio,
                    None => flattened.push((leaf, ratio)),
                }
            }
        }
        leaves[index] = Some(flattened);
    }

    let mut leaves = vec![None; morphs.len()];
    for i in 0..morphs.len() {
        visit(morphs, i, &mut leaves);
    }
    leaves.into_iter().map(Option::unwrap_or_default).collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    OnStack,
    Done,
}

/// 切断组 Morph 中的循环引用，被切断的子索引改写为 -1
///
/// 每条边只访问一次。返回切断的边数，每条边记录一次警告。
fn sever_group_cycles(morphs: &mut [RuntimeMorph]) -> usize {
    fn visit(morphs: &mut [RuntimeMorph], index: usize, states: &mut [VisitState]) -> usize {
        states[index] = VisitState::OnStack;
        let child_count = match &morphs[index].data {
            MorphData::Group { indices, .. } => indices.len(),
            _ => 0,
        };
        let count = morphs.len();
        let mut severed = 0;
        for k in 0..child_count {
            let child = match &morphs[index].data {
                MorphData::Group { indices, .. } => indices[k],
                _ => break,
            };
            if child < 0 || child as usize >= count {
                continue;
            }
            let child = child as usize;
            match states[child] {
                VisitState::Done => {}
                VisitState::Unvisited => severed += visit(morphs, child, states),
                VisitState::OnStack => {
                    log::warn!(
                        "[Morph] 组 Morph 循环引用: '{}' -> '{}'，已切断",
                        morphs[index].name,
                        morphs[child].name
                    );
                    if let MorphData::Group { indices, .. } = &mut morphs[index].data {
                        indices[k] = -1;
                    }
                    severed += 1;
                }
            }
        }
        states[index] = VisitState::Done;
        severed
    }

    let mut states = vec![VisitState::Unvisited; morphs.len()];
    let mut severed = 0;
    for i in 0..morphs.len() {
        if states[i] == VisitState::Unvisited {
            severed += visit(morphs, i, &mut states);
        }
    }
    severed
}

/// 构建时一次性报告绑定不到的骨骼与材质索引
fn warn_unbound_targets(morphs: &[RuntimeMorph], material_count: usize, bone_count: usize) {
    for morph in morphs {
        match &morph.data {
            MorphData::Bone { indices, .. } => {
                for &b in indices {
                    if b < 0 || b as usize >= bone_count {
                        log::warn!("[Morph] '{}' 引用了无效骨骼索引 {}", morph.name, b);
                    }
                }
            }
            MorphData::Material(elements) => {
                for element in elements {
                    let m = element.material_index;
                    if m < -1 || (m >= 0 && m as usize >= material_count) {
                        log::warn!("[Morph] '{}' 引用了无效材质索引 {}", morph.name, m);
                    }
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// 叶子 Morph 操作
// ============================================================================

fn reset_morph(
    morphs: &[RuntimeMorph],
    leaves: &[(usize, f32)],
    bones: &mut BoneSet,
    materials: &mut [Box<dyn MaterialProxy>],
) {
    for &(leaf, _) in leaves {
        match &morphs[leaf].data {
            MorphData::Group { .. } => {}
            MorphData::Bone { indices, .. } => {
                for &b in indices {
                    if let Some(bone) = usize::try_from(b).ok().and_then(|b| bones.get_mut(b)) {
                        bone.morph_position_offset = None;
                        bone.morph_rotation_offset = None;
                    }
                }
            }
            MorphData::Material(elements) => {
                for element in elements {
                    if element.material_index < 0 {
                        materials.iter_mut().for_each(|m| m.reset());
                    } else if let Some(m) = materials.get_mut(element.material_index as usize) {
                        m.reset();
                    }
                }
            }
            MorphData::Vertex(targets) | MorphData::Uv { targets, .. } => {
                for target in targets {
                    target.set_influence(0.0);
                }
            }
        }
    }
}

fn apply_morph(
    morphs: &[RuntimeMorph],
    leaves: &[(usize, f32)],
    weight: f32,
    bones: &mut BoneSet,
    materials: &mut [Box<dyn MaterialProxy>],
    touched: &mut Vec<usize>,
    is_touched: &mut [bool],
) {
    for &(leaf, ratio) in leaves {
        let w = weight * ratio;
        match &morphs[leaf].data {
            MorphData::Group { .. } => {}
            MorphData::Bone { .. } if w == 0.0 => {}
            MorphData::Bone { indices, positions, rotations } => {
                for ((&b, &position), &rotation) in indices.iter().zip(positions).zip(rotations) {
                    let Some(bone) = usize::try_from(b).ok().and_then(|b| bones.get_mut(b)) else {
                        continue;
                    };
                    let offset = bone.morph_position_offset.unwrap_or(Vec3::ZERO);
                    bone.morph_position_offset = Some(offset + position * w);
                    let base = bone.morph_rotation_offset.unwrap_or(Quat::IDENTITY);
                    bone.morph_rotation_offset = Some(base.slerp(rotation, w));
                }
            }
            MorphData::Material(elements) => {
                for element in elements {
                    let range = if element.material_index < 0 {
                        0..materials.len()
                    } else {
                        let m = element.material_index as usize;
                        if m >= materials.len() {
                            continue;
                        }
                        m..m + 1
                    };
                    for m in range {
                        element.apply(materials[m].channels_mut(), w);
                        if !is_touched[m] {
                            is_touched[m] = true;
                            touched.push(m);
                        }
                    }
                }
            }
            MorphData::Vertex(targets) | MorphData::Uv { targets, .. } => {
                for target in targets {
                    target.set_influence(target.influence() + w);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use glam::Vec4;

    use super::*;
    use crate::morph::{
        AtomicMorphTarget, MaterialBlendMode, MaterialChannels, MaterialMorphElement, MorphTarget,
        StandardMaterialProxy,
    };
    use crate::skeleton::BoneMetadata;

    /// 统计 apply_changes 调用次数的材质
    struct CountingProxy {
        inner: StandardMaterialProxy,
        commits: Arc<AtomicUsize>,
    }

    impl MaterialProxy for CountingProxy {
        fn reset(&mut self) {
            self.inner.reset();
        }
        fn apply_changes(&mut self) {
            self.commits.fetch_add(1, Ordering::SeqCst);
            self.inner.apply_changes();
        }
        fn channels(&self) -> &MaterialChannels {
            self.inner.channels()
        }
        fn channels_mut(&mut self) -> &mut MaterialChannels {
            self.inner.channels_mut()
        }
    }

    fn one_bone() -> BoneSet {
        BoneSet::new(&[BoneMetadata::new("センター", -1, Vec3::ZERO)])
    }

    fn diffuse_multiply(material_index: i32, factor: f32) -> MaterialMorphElement {
        let mut delta = MaterialChannels::multiply_identity();
        delta.diffuse = Vec4::splat(factor);
        MaterialMorphElement::new(material_index, MaterialBlendMode::Multiply, &delta)
    }

    #[test]
    fn test_set_weight_activates_and_zero_deactivates() {
        let target = Arc::new(AtomicMorphTarget::new());
        let morphs = vec![RuntimeMorph::vertex("あ", vec![target.clone() as Arc<dyn MorphTarget>])];
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        let mut bones = one_bone();

        controller.set_morph_weight("あ", 0.6);
        controller.update(&mut bones);
        assert!((target.influence() - 0.6).abs() < 1e-6);
        assert_eq!(controller.active_morph_names().count(), 1);

        controller.set_morph_weight("あ", 0.0);
        controller.update(&mut bones);
        assert_eq!(target.influence(), 0.0);
        assert_eq!(controller.active_morph_names().count(), 0);
    }

    #[test]
    fn test_duplicate_names_share_weight() {
        let morphs = vec![
            RuntimeMorph::group("まばたき", vec![], vec![]),
            RuntimeMorph::group("まばたき", vec![], vec![]),
        ];
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        assert_eq!(controller.morph_indices("まばたき"), Some(&[0usize, 1][..]));

        controller.set_morph_weight("まばたき", 0.3);
        assert_eq!(controller.morph_weights(), &[0.3, 0.3]);
        assert_eq!(controller.get_morph_weight("まばたき"), 0.3);
        assert_eq!(controller.get_morph_weight("unknown"), 0.0);
    }

    #[test]
    fn test_set_weight_from_invalid_index_fails() {
        let mut controller = MorphController::new(Vec::new(), Vec::new(), 0).unwrap();
        assert!(matches!(
            controller.set_morph_weight_from_index(3, 1.0),
            Err(MmdError::InvalidMorphIndex(3))
        ));
    }

    #[test]
    fn test_group_flatten_matches_direct_application() {
        // 组 G: 0.5 * A，A: 顶点目标
        let grouped = Arc::new(AtomicMorphTarget::new());
        let morphs = vec![
            RuntimeMorph::vertex("A", vec![grouped.clone() as Arc<dyn MorphTarget>]),
            RuntimeMorph::group("G", vec![0], vec![0.5]),
        ];
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        let mut bones = one_bone();
        controller.set_morph_weight("G", 0.8);
        controller.update(&mut bones);

        let direct = Arc::new(AtomicMorphTarget::new());
        let morphs = vec![RuntimeMorph::vertex("A", vec![direct.clone() as Arc<dyn MorphTarget>])];
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        controller.set_morph_weight("A", 0.4);
        controller.update(&mut bones);

        assert!((grouped.influence() - direct.influence()).abs() < 1e-6);
    }

    #[test]
    fn test_nested_group_multiplies_ratios() {
        let target = Arc::new(AtomicMorphTarget::new());
        let morphs = vec![
            RuntimeMorph::vertex("leaf", vec![target.clone() as Arc<dyn MorphTarget>]),
            RuntimeMorph::group("inner", vec![0], vec![0.5]),
            RuntimeMorph::group("outer", vec![1], vec![0.5]),
        ];
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        controller.set_morph_weight("outer", 1.0);
        controller.update(&mut one_bone());
        assert!((target.influence() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_group_cycles_are_severed_once_per_edge() {
        let mut morphs = vec![
            RuntimeMorph::group("A", vec![1], vec![1.0]),
            RuntimeMorph::group("B", vec![0], vec![1.0]),
            RuntimeMorph::group("C", vec![2], vec![1.0]),
        ];
        assert_eq!(sever_group_cycles(&mut morphs), 2);
        assert_eq!(sever_group_cycles(&mut morphs), 0);

        let MorphData::Group { indices, .. } = &morphs[2].data else {
            panic!("expected group");
        };
        assert_eq!(indices, &[-1]);

        // 切断后的控制器可以正常更新
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        controller.set_morph_weight("A", 1.0);
        controller.update(&mut one_bone());
    }

    #[test]
    fn test_material_committed_once_per_frame() {
        let commits = Arc::new(AtomicUsize::new(0));
        let materials: Vec<Box<dyn MaterialProxy>> = vec![Box::new(CountingProxy {
            inner: StandardMaterialProxy::new(MaterialChannels::default()),
            commits: commits.clone(),
        })];
        let morphs = vec![
            RuntimeMorph::material("暗い", vec![diffuse_multiply(0, 0.5)]),
            RuntimeMorph::material("全体", vec![diffuse_multiply(-1, 0.5)]),
        ];
        let mut controller = MorphController::new(morphs, materials, 0).unwrap();
        let mut bones = one_bone();

        controller.set_morph_weight("暗い", 1.0);
        controller.set_morph_weight("全体", 1.0);
        controller.update(&mut bones);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert!(controller.materials()[0]
            .channels()
            .diffuse
            .abs_diff_eq(Vec4::splat(0.25), 1e-6));

        // 重复更新不会累积
        controller.update(&mut bones);
        assert_eq!(commits.load(Ordering::SeqCst), 2);
        assert!(controller.materials()[0]
            .channels()
            .diffuse
            .abs_diff_eq(Vec4::splat(0.25), 1e-6));
    }

    #[test]
    fn test_zero_weight_restores_initial_material() {
        let materials: Vec<Box<dyn MaterialProxy>> =
            vec![Box::new(StandardMaterialProxy::new(MaterialChannels::default()))];
        let morphs = vec![RuntimeMorph::material("暗い", vec![diffuse_multiply(0, 0.0)])];
        let mut controller = MorphController::new(morphs, materials, 0).unwrap();
        let mut bones = one_bone();

        controller.set_morph_weight("暗い", 1.0);
        controller.update(&mut bones);
        assert_eq!(controller.materials()[0].channels().diffuse, Vec4::ZERO);

        controller.reset_morph_weights();
        controller.update(&mut bones);
        assert_eq!(
            controller.materials()[0].channels(),
            &MaterialChannels::default()
        );
    }

    #[test]
    fn test_bone_morph_writes_offsets() {
        let rotation = Quat::from_rotation_y(1.0);
        let morphs = vec![RuntimeMorph::bone(
            "首振り",
            vec![0],
            vec![Vec3::new(0.0, 2.0, 0.0)],
            vec![rotation],
        )];
        let mut controller = MorphController::new(morphs, Vec::new(), 1).unwrap();
        let mut bones = one_bone();

        controller.set_morph_weight("首振り", 0.5);
        controller.update(&mut bones);
        let bone = bones.get(0).unwrap();
        assert!(bone
            .morph_position_offset
            .unwrap()
            .abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-6));
        assert!(bone
            .morph_rotation_offset
            .unwrap()
            .abs_diff_eq(Quat::from_rotation_y(0.5), 1e-5));

        controller.set_morph_weight("首振り", 0.0);
        controller.update(&mut bones);
        let bone = bones.get(0).unwrap();
        assert!(bone.morph_position_offset.is_none());
        assert!(bone.morph_rotation_offset.is_none());
    }

    #[test]
    fn test_layered_shared_groups_flatten_once() {
        // 每层两个组，各以 0.5 引用下一层的两个组，最后一层引用叶子
        const LAYERS: usize = 24;
        let target = Arc::new(AtomicMorphTarget::new());
        let mut morphs = vec![RuntimeMorph::vertex("leaf", vec![target.clone() as Arc<dyn MorphTarget>])];
        for layer in 0..LAYERS {
            for side in ["a", "b"] {
                let name = format!("layer{}_{}", layer, side);
                let morph = if layer + 1 == LAYERS {
                    RuntimeMorph::group(name, vec![0], vec![1.0])
                } else {
                    let next = (1 + 2 * (layer + 1)) as i32;
                    RuntimeMorph::group(name, vec![next, next + 1], vec![0.5, 0.5])
                };
                morphs.push(morph);
            }
        }

        assert_eq!(sever_group_cycles(&mut morphs), 0);
        let flattened = flatten_groups(&morphs);
        assert_eq!(flattened[1].len(), 1);
        assert_eq!(flattened[1][0].0, 0);
        assert!((flattened[1][0].1 - 1.0).abs() < 1e-6);
        assert_eq!(flattened[0], vec![(0, 1.0)]);

        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        let mut bones = one_bone();
        controller.set_morph_weight("layer0_a", 0.8);
        controller.update(&mut bones);
        assert!((target.influence() - 0.8).abs() < 1e-5);

        controller.set_morph_weight("layer0_a", 0.0);
        controller.update(&mut bones);
        assert_eq!(target.influence(), 0.0);
    }

    #[test]
    fn test_uv_morph_zero_weight_restores_influence() {
        let target = Arc::new(AtomicMorphTarget::new());
        let morphs = vec![RuntimeMorph::uv("uv_scroll", 1, vec![target.clone() as Arc<dyn MorphTarget>])];
        let mut controller = MorphController::new(morphs, Vec::new(), 0).unwrap();
        let mut bones = one_bone();

        controller.set_morph_weight("uv_scroll", 0.7);
        controller.update(&mut bones);
        assert!((target.influence() - 0.7).abs() < 1e-6);

        // 重复更新不会累积
        controller.update(&mut bones);
        assert!((target.influence() - 0.7).abs() < 1e-6);

        controller.set_morph_weight("uv_scroll", 0.0);
        controller.update(&mut bones);
        assert_eq!(target.influence(), 0.0);
        assert_eq!(controller.active_morph_names().count(), 0);
    }

    #[test]
    fn test_group_zero_weight_restores_all_children() {
        let uv_target = Arc::new(AtomicMorphTarget::new());
        let vertex_target = Arc::new(AtomicMorphTarget::new());
        let materials: Vec<Box<dyn MaterialProxy>> =
            vec![Box::new(StandardMaterialProxy::new(MaterialChannels::default()))];
        let morphs = vec![
            RuntimeMorph::bone("首振り", vec![0], vec![Vec3::new(0.0, 2.0, 0.0)], vec![Quat::from_rotation_y(1.0)]),
            RuntimeMorph::material("暗い", vec![diffuse_multiply(0, 0.5)]),
            RuntimeMorph::uv("uv_scroll", 1, vec![uv_target.clone() as Arc<dyn MorphTarget>]),
            RuntimeMorph::vertex("あ", vec![vertex_target.clone() as Arc<dyn MorphTarget>]),
            RuntimeMorph::group("まとめ", vec![0, 1, 2, 3], vec![1.0, 1.0, 0.5, 0.5]),
        ];
        let mut controller = MorphController::new(morphs, materials, 1).unwrap();
        let mut bones = one_bone();

        controller.set_morph_weight("まとめ", 1.0);
        controller.update(&mut bones);
        let bone = bones.get(0).unwrap();
        assert!(bone
            .morph_position_offset
            .unwrap()
            .abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-6));
        assert!(controller.materials()[0]
            .channels()
            .diffuse
            .abs_diff_eq(Vec4::splat(0.5), 1e-6));
        assert!((uv_target.influence() - 0.5).abs() < 1e-6);
        assert!((vertex_target.influence() - 0.5).abs() < 1e-6);

        controller.set_morph_weight("まとめ", 0.0);
        controller.update(&mut bones);
        let bone = bones.get(0).unwrap();
        assert!(bone.morph_position_offset.is_none());
        assert!(bone.morph_rotation_offset.is_none());
        assert_eq!(controller.materials()[0].channels(), &MaterialChannels::default());
        assert_eq!(uv_target.influence(), 0.0);
        assert_eq!(vertex_target.influence(), 0.0);
        assert_eq!(controller.active_morph_names().count(), 0);
    }
}
