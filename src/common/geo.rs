//! 坐标转换模块
//! ECEF 直角坐标转 WGS84 大地坐标（Bowring 闭式近似，无迭代）

use serde::{Deserialize, Serialize};

/// WGS84 长半轴 (m)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 扁率
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 短半轴 (m)
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
/// 第一偏心率平方
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);
/// 第二偏心率平方
pub const WGS84_EP2: f64 = WGS84_E2 / (1.0 - WGS84_E2);

/// ECEF 坐标 (m)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ecef {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// 大地坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geodetic {
    /// 纬度 (度)
    pub latitude: f64,
    /// 经度 (度)
    pub longitude: f64,
    /// 椭球高 (m)
    pub altitude: f64,
}

impl Ecef {
    pub fn to_geodetic(&self) -> Option<Geodetic> {
        ecef_to_geodetic(self.x, self.y, self.z)
    }
}

/// ECEF 转大地坐标
///
/// 非有限输入返回 `None`。极轴上 (x = y = 0) 返回纬度 ±90°、经度 0°、
/// 高程 |z| - b；地心返回 (0°, 0°, -a)。
pub fn ecef_to_geodetic(x: f64, y: f64, z: f64) -> Option<Geodetic> {
    if !(x.is_finite() && y.is_finite() && z.is_finite()) {
        return None;
    }

    let r = x.hypot(y);
    if r == 0.0 {
        if z == 0.0 {
            return Some(Geodetic {
                latitude: 0.0,
                longitude: 0.0,
                altitude: -WGS84_A,
            });
        }
        return Some(Geodetic {
            latitude: 90f64.copysign(z),
            longitude: 0.0,
            altitude: z.abs() - WGS84_B,
        });
    }

    let longitude = y.atan2(x);
    let theta = (z * WGS84_A).atan2(r * WGS84_B);
    let (sin_t, cos_t) = theta.sin_cos();

    let lat = (z + WGS84_EP2 * WGS84_B * sin_t.powi(3))
        .atan2(r - WGS84_E2 * WGS84_A * cos_t.powi(3));
    let (sin_lat, cos_lat) = lat.sin_cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    // 高纬度时 r/cos(lat) 不稳定，改用 z 分量
    let altitude = if cos_lat.abs() > 1e-3 {
        r / cos_lat - n
    } else {
        z.abs() / sin_lat.abs() - n * (1.0 - WGS84_E2)
    };

    Some(Geodetic {
        latitude: lat.to_degrees(),
        longitude: longitude.to_degrees(),
        altitude,
    })
}
