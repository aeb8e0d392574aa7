//! RTCM 数据解析模块
//! 在字节流中查找 RTCM3 帧、校验 CRC-24Q，并解码基准站天线坐标（1005/1006）
//!
//! 帧格式: `0xD3 | 6位保留 + 10位长度 | 载荷 | CRC-24Q (3字节, 大端)`。
//! CRC 按长度字节 + 载荷计算；同时接受 RTCM 10403 的覆盖方式（含前导字节），
//! 以便直接校验接收机原始数据流。

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::crc::{crc24q, read_u24_be};
use super::error::ParseError;
use super::geo::{Ecef, Geodetic};

/// 帧前导字节
pub const PREAMBLE: u8 = 0xD3;
/// 帧头长度（前导 + 2字节长度）
pub const HEADER_LEN: usize = 3;
/// CRC 长度
pub const CRC_LEN: usize = 3;
/// 最大载荷长度（10位）
pub const MAX_PAYLOAD_LEN: usize = 1023;
/// 最大帧长度
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + CRC_LEN;

/// 固定天线参考点
pub const MSG_ANTENNA_REFERENCE: u16 = 1005;
/// 固定天线参考点（含天线高）
pub const MSG_ANTENNA_REFERENCE_HEIGHT: u16 = 1006;

/// 1005 载荷字节数 (152 位)
const ARP_PAYLOAD_LEN: usize = 19;
/// 1006 载荷字节数 (168 位)
const ARP_HEIGHT_PAYLOAD_LEN: usize = 21;
/// 坐标缩放 0.1mm
const ECEF_SCALE: f64 = 1e-4;

/// CRC 覆盖范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcCoverage {
    /// 长度字节 + 载荷
    LengthAndPayload,
    /// 前导字节 + 长度字节 + 载荷 (RTCM 10403)
    Standard,
}

/// 扫描得到的一帧（借用原缓冲区）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcmFrame<'a> {
    /// 前导字节在缓冲区中的偏移
    pub offset: usize,
    /// 载荷
    pub payload: &'a [u8],
    /// 传输的 CRC
    pub transmitted_crc: u32,
    /// 长度字节 + 载荷的 CRC
    pub computed_crc: u32,
    /// 含前导字节的 CRC
    pub standard_crc: u32,
}

impl<'a> RtcmFrame<'a> {
    /// 载荷长度
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// 整帧长度
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }

    pub fn is_valid(&self) -> bool {
        self.coverage().is_some()
    }

    /// 与传输 CRC 匹配的覆盖方式，均不匹配返回 `None`
    pub fn coverage(&self) -> Option<CrcCoverage> {
        if self.transmitted_crc == self.computed_crc {
            Some(CrcCoverage::LengthAndPayload)
        } else if self.transmitted_crc == self.standard_crc {
            Some(CrcCoverage::Standard)
        } else {
            None
        }
    }

    /// 载荷前 12 位
    pub fn message_number(&self) -> Option<u16> {
        (self.payload.len() >= 2).then(|| BitReader::new(self.payload).read_u64(12) as u16)
    }

    /// 载荷第 13-24 位
    pub fn station_id(&self) -> Option<u16> {
        (self.payload.len() >= 3).then(|| {
            let mut reader = BitReader::new(self.payload);
            reader.skip(12);
            reader.read_u64(12) as u16
        })
    }

    /// 解码载荷
    ///
    /// 只解码天线参考点消息；其余消息返回通用头信息。
    pub fn decode(&self) -> Result<RtcmMessage, ParseError> {
        if !self.is_valid() {
            return Err(ParseError::CrcMismatch {
                transmitted: self.transmitted_crc,
                computed: self.computed_crc,
            });
        }
        let message_number = self.message_number().ok_or(ParseError::PayloadTooShort {
            message_number: 0,
            needed: 2,
            actual: self.payload.len(),
        })?;

        match message_number {
            MSG_ANTENNA_REFERENCE | MSG_ANTENNA_REFERENCE_HEIGHT => {
                AntennaPosition::decode(self.payload).map(RtcmMessage::AntennaPosition)
            }
            _ => Ok(RtcmMessage::Generic {
                message_number,
                station_id: self.station_id(),
            }),
        }
    }
}

/// 解码后的消息
#[derive(Debug, Clone, PartialEq)]
pub enum RtcmMessage {
    /// 未解码的消息，仅包含头信息
    Generic {
        message_number: u16,
        station_id: Option<u16>,
    },
    /// 天线参考点
    AntennaPosition(AntennaPosition),
}

impl RtcmMessage {
    pub fn message_number(&self) -> u16 {
        match self {
            RtcmMessage::Generic { message_number, .. } => *message_number,
            RtcmMessage::AntennaPosition(pos) => pos.message_number,
        }
    }
}

/// 基准站天线参考点 (RTCM 1005/1006)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaPosition {
    /// 消息类型
    pub message_number: u16,
    /// 基准站ID
    pub station_id: u16,
    /// ITRF 实现年份
    pub itrf_year: u8,
    /// ECEF 坐标 (m)
    pub ecef: Ecef,
    /// 天线高 (m)，仅 1006
    pub antenna_height: Option<f64>,
    /// 大地坐标
    pub geodetic: Option<Geodetic>,
}

impl AntennaPosition {
    /// 按 RTCM 10403 字段布局解码
    ///
    /// 站号之后依次为 ITRF 年份 (6)、4 个指示位、X (38)、2 位振荡器/保留位、
    /// Y (38)、2 位四分之一周期指示、Z (38)；三个坐标字段并不紧接站号排列。
    fn decode(payload: &[u8]) -> Result<Self, ParseError> {
        let mut reader = BitReader::new(payload);
        let message_number = reader.read_u64(12) as u16;
        let needed = match message_number {
            MSG_ANTENNA_REFERENCE => ARP_PAYLOAD_LEN,
            MSG_ANTENNA_REFERENCE_HEIGHT => ARP_HEIGHT_PAYLOAD_LEN,
            other => return Err(ParseError::UnsupportedMessage(other)),
        };
        if payload.len() < needed {
            return Err(ParseError::PayloadTooShort {
                message_number,
                needed,
                actual: payload.len(),
            });
        }

        let station_id = reader.read_u64(12) as u16;
        let itrf_year = reader.read_u64(6) as u8;
        // GPS/GLONASS/Galileo/参考站 指示位
        reader.skip(4);
        let x = reader.read_i64(38);
        // 单接收机振荡器 + 保留位
        reader.skip(2);
        let y = reader.read_i64(38);
        // 四分之一周期指示
        reader.skip(2);
        let z = reader.read_i64(38);
        let antenna_height = (message_number == MSG_ANTENNA_REFERENCE_HEIGHT)
            .then(|| reader.read_u64(16) as f64 * ECEF_SCALE);

        let ecef = Ecef {
            x: x as f64 * ECEF_SCALE,
            y: y as f64 * ECEF_SCALE,
            z: z as f64 * ECEF_SCALE,
        };

        Ok(Self {
            message_number,
            station_id,
            itrf_year,
            ecef,
            antenna_height,
            geodetic: ecef.to_geodetic(),
        })
    }

    /// 编码为 1005/1006 载荷（不含帧头和 CRC）
    pub fn encode_payload(&self) -> Bytes {
        let height = self.message_number == MSG_ANTENNA_REFERENCE_HEIGHT;
        let mut writer = BitWriter::default();
        writer.write(self.message_number as u64, 12);
        writer.write(self.station_id as u64, 12);
        writer.write(self.itrf_year as u64, 6);
        writer.write(0b1000, 4);
        writer.write_signed(to_units(self.ecef.x), 38);
        writer.write(0, 2);
        writer.write_signed(to_units(self.ecef.y), 38);
        writer.write(0, 2);
        writer.write_signed(to_units(self.ecef.z), 38);
        if height {
            let h = self.antenna_height.unwrap_or(0.0);
            writer.write(to_units(h).max(0) as u64, 16);
        }
        writer.finish()
    }
}

fn to_units(meters: f64) -> i64 {
    (meters / ECEF_SCALE).round() as i64
}

/// 将载荷封装为完整 RTCM3 帧，CRC 覆盖长度字节和载荷
///
/// 载荷超过 1023 字节时返回 `None`。
pub fn encode_frame(payload: &[u8]) -> Option<Bytes> {
    encode_frame_with(payload, CrcCoverage::LengthAndPayload)
}

/// 按指定 CRC 覆盖方式封装帧
pub fn encode_frame_with(payload: &[u8], coverage: CrcCoverage) -> Option<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return None;
    }
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    frame.put_u8(PREAMBLE);
    frame.put_u16(payload.len() as u16);
    frame.extend_from_slice(payload);
    let crc = match coverage {
        CrcCoverage::LengthAndPayload => crc24q(&frame[1..]),
        CrcCoverage::Standard => crc24q(&frame),
    };
    frame.put_slice(&crc.to_be_bytes()[1..]);
    Some(frame.freeze())
}

/// 单缓冲区帧扫描器
///
/// 惰性迭代；迭代结束后 `consumed()` 给出未处理数据的起始位置，
/// 不完整的尾部帧从该位置开始保留。
#[derive(Debug, Clone)]
pub struct FrameScanner<'a> {
    data: &'a [u8],
    pos: usize,
    skipped: usize,
}

impl<'a> FrameScanner<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            skipped: 0,
        }
    }

    /// 已处理（可丢弃）的字节数
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// 因重同步跳过的字节数
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<'a> Iterator for FrameScanner<'a> {
    type Item = RtcmFrame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let rest = &self.data[self.pos..];
            if rest[0] != PREAMBLE {
                self.pos += 1;
                self.skipped += 1;
                continue;
            }
            if rest.len() < HEADER_LEN {
                // 帧头不完整，等待更多数据
                return None;
            }
            if rest[1] & 0xFC != 0 {
                // 保留位非零，不是帧起点
                self.pos += 1;
                self.skipped += 1;
                continue;
            }

            let length = (((rest[1] & 0x03) as usize) << 8) | rest[2] as usize;
            let frame_len = HEADER_LEN + length + CRC_LEN;
            if rest.len() < frame_len {
                return None;
            }

            let body = &rest[..HEADER_LEN + length];
            let frame = RtcmFrame {
                offset: self.pos,
                payload: &body[HEADER_LEN..],
                transmitted_crc: read_u24_be(&rest[HEADER_LEN + length..frame_len]),
                computed_crc: crc24q(&body[1..]),
                standard_crc: crc24q(body),
            };
            self.pos += frame_len;
            return Some(frame);
        }
        None
    }
}

/// 扫描整个缓冲区
pub fn scan(data: &[u8]) -> FrameScanner<'_> {
    FrameScanner::new(data)
}

/// 按位读取（大端位序）
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    pub fn skip(&mut self, bits: usize) {
        self.bit_pos += bits;
    }

    pub fn remaining(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.bit_pos)
    }

    /// 读取无符号字段，越界部分按 0 处理
    pub fn read_u64(&mut self, bits: usize) -> u64 {
        debug_assert!(bits <= 64);
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.data.get(self.bit_pos / 8).copied().unwrap_or(0);
            let bit = (byte >> (7 - self.bit_pos % 8)) & 1;
            value = (value << 1) | bit as u64;
            self.bit_pos += 1;
        }
        value
    }

    /// 读取二进制补码有符号字段
    pub fn read_i64(&mut self, bits: usize) -> i64 {
        let raw = self.read_u64(bits);
        let shift = 64 - bits;
        ((raw << shift) as i64) >> shift
    }
}

/// 按位写入
#[derive(Debug, Default)]
struct BitWriter {
    buf: BytesMut,
    acc: u8,
    used: u8,
}

impl BitWriter {
    fn write(&mut self, value: u64, bits: usize) {
        for i in (0..bits).rev() {
            self.acc = (self.acc << 1) | ((value >> i) & 1) as u8;
            self.used += 1;
            if self.used == 8 {
                self.buf.put_u8(self.acc);
                self.acc = 0;
                self.used = 0;
            }
        }
    }

    fn write_signed(&mut self, value: i64, bits: usize) {
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.write(value as u64 & mask, bits);
    }

    fn finish(mut self) -> Bytes {
        if self.used > 0 {
            self.buf.put_u8(self.acc << (8 - self.used));
        }
        self.buf.freeze()
    }
}
