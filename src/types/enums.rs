//! 枚举与位域
//!
//! 连续枚举用 `first..=last` 加键名表描述，表中可以有无名的空位；
//! 稀疏枚举只有显式列出的整数才是合法成员，迭代时从一个列出的值
//! 跳到下一个，而不是逐一递增。

use super::primitive::PrimitiveKind;
use std::collections::BTreeMap;

/// 按值查键的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumKey<'a> {
    Named(&'a str),
    /// 在范围内但没有名字
    Unnamed,
    /// 超出声明范围
    OutOfRange,
}

/// 枚举类型
#[derive(Debug, Clone, PartialEq)]
pub struct EnumIdentity {
    /// 底层存储类型
    pub base: PrimitiveKind,
    pub first: i64,
    pub last: i64,
    /// 连续枚举的键名表，下标为 `value - first`
    pub keys: Vec<Option<String>>,
    /// 稀疏枚举的值→键映射
    pub sparse: Option<BTreeMap<i64, String>>,
    /// 每个值的属性
    pub attrs: BTreeMap<i64, BTreeMap<String, String>>,
}

impl EnumIdentity {
    /// 连续枚举，`None` 表示该位置无名
    pub fn contiguous(base: PrimitiveKind, first: i64, keys: &[Option<&str>]) -> Self {
        Self {
            base,
            first,
            last: first + keys.len() as i64 - 1,
            keys: keys.iter().map(|k| k.map(str::to_string)).collect(),
            sparse: None,
            attrs: BTreeMap::new(),
        }
    }

    /// 稀疏枚举
    pub fn sparse(base: PrimitiveKind, values: &[(i64, &str)]) -> Self {
        let map: BTreeMap<i64, String> = values
            .iter()
            .map(|(v, k)| (*v, (*k).to_string()))
            .collect();
        let first = map.keys().next().copied().unwrap_or(0);
        let last = map.keys().next_back().copied().unwrap_or(-1);
        Self {
            base,
            first,
            last,
            keys: Vec::new(),
            sparse: Some(map),
            attrs: BTreeMap::new(),
        }
    }

    /// 附加一个值的属性
    pub fn with_attr(mut self, value: i64, name: &str, attr: &str) -> Self {
        self.attrs
            .entry(value)
            .or_default()
            .insert(name.to_string(), attr.to_string());
        self
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse.is_some()
    }

    /// 按值查键名
    pub fn key_of(&self, value: i64) -> EnumKey<'_> {
        if value < self.first || value > self.last {
            return EnumKey::OutOfRange;
        }
        let name = match &self.sparse {
            Some(map) => map.get(&value).map(String::as_str),
            None => self
                .keys
                .get((value - self.first) as usize)
                .and_then(|k| k.as_deref()),
        };
        name.map_or(EnumKey::Unnamed, EnumKey::Named)
    }

    /// 按键名查值
    pub fn value_of(&self, key: &str) -> Option<i64> {
        match &self.sparse {
            Some(map) => map.iter().find(|(_, k)| k.as_str() == key).map(|(v, _)| *v),
            None => self
                .keys
                .iter()
                .position(|k| k.as_deref() == Some(key))
                .map(|i| self.first + i as i64),
        }
    }

    /// 第一个有名字的值
    pub fn first_item(&self) -> Option<i64> {
        self.next_item(None)
    }

    /// 最后一个有名字的值
    pub fn last_item(&self) -> Option<i64> {
        match &self.sparse {
            Some(map) => map.keys().next_back().copied(),
            None => self
                .keys
                .iter()
                .rposition(|k| k.is_some())
                .map(|i| self.first + i as i64),
        }
    }

    /// `after` 之后的下一个有名字的值，`None` 表示从头开始
    ///
    /// 跳过无名空位；稀疏枚举在列出的值之间跳跃。
    pub fn next_item(&self, after: Option<i64>) -> Option<i64> {
        match &self.sparse {
            Some(map) => match after {
                None => map.keys().next().copied(),
                Some(v) => map
                    .range((std::ops::Bound::Excluded(v), std::ops::Bound::Unbounded))
                    .next()
                    .map(|(k, _)| *k),
            },
            None => {
                let start = match after {
                    None => self.first,
                    Some(v) => v.saturating_add(1).max(self.first),
                };
                (start..=self.last).find(|v| matches!(self.key_of(*v), EnumKey::Named(_)))
            }
        }
    }

    /// 下一个值，到末尾时回到第一个
    pub fn step_wrapping(&self, current: i64) -> Option<i64> {
        self.next_item(Some(current)).or_else(|| self.first_item())
    }

    /// 按顺序列出所有有名字的值
    pub fn items(&self) -> Vec<(i64, &str)> {
        let mut out = Vec::new();
        let mut cursor = self.first_item();
        while let Some(v) = cursor {
            if let EnumKey::Named(k) = self.key_of(v) {
                out.push((v, k));
            }
            cursor = self.next_item(Some(v));
        }
        out
    }
}

/// 位域中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitDescriptor {
    /// 无名项是填充位
    pub name: Option<String>,
    /// 位宽
    pub size: u32,
}

impl BitDescriptor {
    pub fn named(name: &str, size: u32) -> Self {
        Self {
            name: Some(name.to_string()),
            size,
        }
    }

    pub fn padding(size: u32) -> Self {
        Self { name: None, size }
    }
}

/// 位域类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitfieldIdentity {
    pub base: PrimitiveKind,
    pub bits: Vec<BitDescriptor>,
}

/// 位域中一项的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub shift: u32,
    pub size: u32,
}

impl BitSpan {
    pub fn mask(&self) -> u64 {
        if self.size >= 64 {
            u64::MAX
        } else {
            ((1u64 << self.size) - 1) << self.shift
        }
    }

    pub fn extract(&self, whole: u64) -> u64 {
        (whole & self.mask()) >> self.shift
    }

    pub fn insert(&self, whole: u64, value: u64) -> u64 {
        (whole & !self.mask()) | ((value << self.shift) & self.mask())
    }
}

impl BitfieldIdentity {
    pub fn new(base: PrimitiveKind, bits: Vec<BitDescriptor>) -> Self {
        Self { base, bits }
    }

    /// 总位宽
    pub fn total_bits(&self) -> u32 {
        self.bits.iter().map(|b| b.size).sum()
    }

    /// 所有有名字的项及其位置，按声明顺序
    pub fn spans(&self) -> Vec<(&str, BitSpan)> {
        let mut shift = 0;
        let mut out = Vec::new();
        for bit in &self.bits {
            if let Some(name) = &bit.name {
                out.push((
                    name.as_str(),
                    BitSpan {
                        shift,
                        size: bit.size,
                    },
                ));
            }
            shift += bit.size;
        }
        out
    }

    /// 按名字查找
    pub fn find(&self, name: &str) -> Option<BitSpan> {
        self.spans()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, span)| span)
    }

    /// 从第 `after` 位之后找下一个有名字的项的起始位
    ///
    /// 多位项整体跳过，填充位不产生项。
    pub fn next_item(&self, after: Option<u32>) -> Option<u32> {
        self.spans()
            .into_iter()
            .map(|(_, span)| span.shift)
            .find(|shift| after.map_or(true, |a| *shift > a))
    }

    /// 起始位为 `shift` 的项
    pub fn item_at(&self, shift: u32) -> Option<(&str, BitSpan)> {
        self.spans().into_iter().find(|(_, span)| span.shift == shift)
    }
}
