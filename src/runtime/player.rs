//! 动画播放状态机
//!
//! 播放 / 暂停 / 跳转都只是状态转换，每帧由运行时读取当前帧时间。

/// 默认帧率：帧时间以每秒 30 帧计
pub const FRAMES_PER_SECOND: f32 = 30.0;

/// 跳转距离超过该帧数时需要重置物理
pub const PHYSICS_REINIT_FRAME_THRESHOLD: f32 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PlaybackState {
    Playing,
    #[default]
    Paused,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnimationPlayer {
    state: PlaybackState,
    current_frame_time: f32,
    duration: f32,
    time_scale: f32,
    frame_rate: f32,
    physics_reinit_threshold: f32,

    physics_init_requested: bool,
    sync_evaluate_requested: bool,
}

impl Default for AnimationPlayer {
    fn default() -> Self {
        Self {
            state: PlaybackState::Paused,
            current_frame_time: 0.0,
            duration: 0.0,
            time_scale: 1.0,
            frame_rate: FRAMES_PER_SECOND,
            physics_reinit_threshold: PHYSICS_REINIT_FRAME_THRESHOLD,
            physics_init_requested: false,
            sync_evaluate_requested: false,
        }
    }
}

impl AnimationPlayer {
    pub fn new(duration: f32) -> Self {
        Self {
            duration: duration.max(0.0),
            ..Default::default()
        }
    }

    pub fn with_physics_reinit_threshold(mut self, frames: f32) -> Self {
        self.physics_reinit_threshold = frames;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    #[inline]
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    #[inline]
    pub fn current_frame_time(&self) -> f32 {
        self.current_frame_time
    }

    #[inline]
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// 动画长度变化时由运行时更新，当前时间超出时截断
    pub fn set_duration(&mut self, duration: f32) {
        self.duration = duration.max(0.0);
        if self.current_frame_time > self.duration {
            self.current_frame_time = self.duration;
        }
    }

    #[inline]
    pub fn time_scale(&self) -> f32 {
        self.time_scale
    }

    pub fn set_time_scale(&mut self, time_scale: f32) {
        self.time_scale = time_scale;
    }

    /// 开始播放；从第 0 帧开始时请求重置物理
    pub fn play(&mut self) {
        if self.is_playing() {
            return;
        }
        self.state = PlaybackState::Playing;
        if self.current_frame_time == 0.0 {
            self.physics_init_requested = true;
        }
        log::debug!("[动画] 播放: 帧 {:.2}", self.current_frame_time);
    }

    pub fn pause(&mut self) {
        if !self.is_playing() {
            return;
        }
        self.state = PlaybackState::Paused;
        log::debug!("[动画] 暂停: 帧 {:.2}", self.current_frame_time);
    }

    /// 推进 `delta_ms` 毫秒，返回需要求值的帧时间；暂停时返回 `None`
    ///
    /// 到达末尾时停在最后一帧并暂停。
    pub fn advance(&mut self, delta_ms: f32) -> Option<f32> {
        if !self.is_playing() {
            return None;
        }
        self.current_frame_time += delta_ms / 1000.0 * self.frame_rate * self.time_scale;
        if self.current_frame_time >= self.duration {
            self.current_frame_time = self.duration;
            self.state = PlaybackState::Paused;
            log::debug!("[动画] 播放结束: 帧 {:.2}", self.duration);
        }
        Some(self.current_frame_time)
    }

    /// 跳转到指定帧
    ///
    /// 跳转距离超过阈值时请求重置物理。`force_evaluate` 为 true 时，
    /// 即使处于暂停状态也要求本帧同步求值。
    pub fn seek(&mut self, frame_time: f32, force_evaluate: bool) {
        let frame_time = frame_time.clamp(0.0, self.duration);
        if (frame_time - self.current_frame_time).abs() > self.physics_reinit_threshold {
            self.physics_init_requested = true;
        }
        self.current_frame_time = frame_time;
        if force_evaluate {
            self.sync_evaluate_requested = true;
        }
        log::debug!("[动画] 跳转: 帧 {:.2}", frame_time);
    }

    /// 取出物理重置请求
    pub fn take_physics_init_request(&mut self) -> bool {
        std::mem::take(&mut self.physics_init_requested)
    }

    /// 取出同步求值请求
    pub fn take_sync_evaluate_request(&mut self) -> bool {
        std::mem::take(&mut self.sync_evaluate_requested)
    }
}
