//! 贝塞尔曲线
//!
//! 关键帧之间的非线性插值。控制点以 [0, 127] 的整数参数给出。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use glam::Vec2;

/// 曲线 trait
pub trait Curve {
    fn value(&self, x: f32) -> f32;
}

/// 三次贝塞尔曲线
///
/// 端点固定为 (0,0) 与 (1,1)，构建时按区间数预采样。
#[derive(Debug, Clone, PartialEq)]
pub struct BezierCurve {
    /// 按 x 升序排列的采样点
    samples: Vec<Vec2>,
    interval: u32,
}

impl BezierCurve {
    /// 直线插值对应的参数
    pub const LINEAR: [u8; 4] = [20, 20, 107, 107];

    pub fn new(c0: Vec2, c1: Vec2, interval: u32) -> Self {
        let interval = interval.max(1);
        let step = 1.0 / interval as f32;

        let mut samples: Vec<Vec2> = (0..=interval)
            .map(|i| {
                let t = i as f32 * step;
                let it = 1.0 - t;
                // B(t) = 3(1-t)²t·c0 + 3(1-t)t²·c1 + t³
                c0 * (3.0 * it * it * t) + c1 * (3.0 * it * t * t) + Vec2::ONE * (t * t * t)
            })
            .collect();
        samples.sort_unstable_by(|a, b| a.x.total_cmp(&b.x));

        Self { samples, interval }
    }

    /// 从 [x0, y0, x1, y1] 整数参数创建
    pub fn from_parameters(parameters: [u8; 4], interval: u32) -> Self {
        let c0 = Vec2::new(parameters[0] as f32, parameters[1] as f32) / 127.0;
        let c1 = Vec2::new(parameters[2] as f32, parameters[3] as f32) / 127.0;
        Self::new(c0, c1, interval)
    }

    #[inline]
    pub fn interval(&self) -> u32 {
        self.interval
    }
}

impl Curve for BezierCurve {
    /// 在相邻采样点之间线性插值
    fn value(&self, x: f32) -> f32 {
        let upper = self.samples.partition_point(|p| p.x <= x);
        if upper == 0 {
            return self.samples[0].y;
        }
        if upper >= self.samples.len() {
            return self.samples[self.samples.len() - 1].y;
        }
        let (a, b) = (self.samples[upper - 1], self.samples[upper]);
        if a.x == b.x {
            a.y
        } else {
            a.y + (x - a.x) * (b.y - a.y) / (b.x - a.x)
        }
    }
}

/// 贝塞尔曲线工厂 trait
pub trait BezierCurveFactory {
    fn get_or_new(&self, parameters: [u8; 4], interval: u32) -> Arc<BezierCurve>;
}

/// 贝塞尔曲线缓存
///
/// 相同参数的曲线只创建一次；请求的区间数大于缓存时重新采样并替换。
#[derive(Debug, Default)]
pub struct BezierCurveCache(RwLock<HashMap<[u8; 4], Arc<BezierCurve>>>);

impl BezierCurveCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BezierCurveFactory for BezierCurveCache {
    fn get_or_new(&self, parameters: [u8; 4], interval: u32) -> Arc<BezierCurve> {
        {
            let map = self.0.read().unwrap_or_else(|e| e.into_inner());
            if let Some(curve) = map.get(&parameters) {
                if curve.interval >= interval {
                    return curve.clone();
                }
            }
        }

        let curve = Arc::new(BezierCurve::from_parameters(parameters, interval));
        let mut map = self.0.write().unwrap_or_else(|e| e.into_inner());
        map.insert(parameters, curve.clone());
        curve
    }
}

impl Clone for BezierCurveCache {
    fn clone(&self) -> Self {
        // 克隆得到空缓存
        Self::new()
    }
}
