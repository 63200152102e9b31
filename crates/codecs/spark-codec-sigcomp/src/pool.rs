//! # 定长槽位池
//!
//! # 模块角色（Why）
//! - 压缩舱、状态结构、挂起 UDVM 都来自对端可控的输入，必须有硬上限；
//! - 句柄携带代际号，槽位被释放并复用后旧句柄自动失效，“释放后访问”退化为一次 `None`。
//!
//! # 核心机制（How）
//! - 槽位向量按需增长到 `capacity`，之后只复用空闲链表中的下标；
//! - 每次 `remove` 都会递增该槽的代际号；
//! - `max_used` 记录历史峰值，供资源观测使用。
//!
//! # 契约说明（What）
//! - `insert` 在满载时返回 [`SigCompError::OutOfResources`]，不做任何排队；
//! - 池本身不加锁，由持有者放在各自的管理器锁之下。

use crate::error::{Result, SigCompError};

/// 带代际号的槽位句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// 槽位下标。
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// 代际号。
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// 池的资源使用快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// 池容量。
    pub allocated: usize,
    /// 当前占用数。
    pub in_use: usize,
    /// 历史最大占用数。
    pub max_used: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// 定长、代际校验的槽位池。
#[derive(Debug)]
pub struct SlotArena<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    in_use: usize,
    max_used: usize,
}

impl<T> SlotArena<T> {
    /// 创建容量为 `capacity` 的池；`name` 出现在资源耗尽错误中。
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            in_use: 0,
            max_used: 0,
        }
    }

    /// 放入一个值，返回其句柄。
    pub fn insert(&mut self, value: T) -> Result<SlotKey> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(SigCompError::out_of_resources(self.name)),
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.in_use += 1;
        self.max_used = self.max_used.max(self.in_use);
        Ok(SlotKey {
            index,
            generation: slot.generation,
        })
    }

    /// 取出句柄对应的值；句柄过期时返回 `None`。
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index())?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.in_use -= 1;
        Some(value)
    }

    /// 只读访问。
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index())
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// 可变访问。
    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index())
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// 按下标访问当前占用者，返回其完整句柄。
    pub fn get_by_index(&self, index: usize) -> Option<(SlotKey, &T)> {
        let slot = self.slots.get(index)?;
        let value = slot.value.as_ref()?;
        Some((
            SlotKey {
                index: index as u32,
                generation: slot.generation,
            },
            value,
        ))
    }

    /// 按下标可变访问当前占用者。
    pub fn get_by_index_mut(&mut self, index: usize) -> Option<(SlotKey, &mut T)> {
        let slot = self.slots.get_mut(index)?;
        let generation = slot.generation;
        let value = slot.value.as_mut()?;
        Some((
            SlotKey {
                index: index as u32,
                generation,
            },
            value,
        ))
    }

    /// 遍历所有占用中的槽位。
    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    /// 取走所有占用中的值，池清空但容量不变。
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.in_use);
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.in_use = 0;
        out
    }

    /// 当前占用数。
    pub fn len(&self) -> usize {
        self.in_use
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// 池容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 资源使用快照。
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            allocated: self.capacity,
            in_use: self.in_use,
            max_used: self.max_used,
        }
    }
}
