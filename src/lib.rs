// 机顶盒 TS 播放引擎

pub mod core;
pub mod player;
