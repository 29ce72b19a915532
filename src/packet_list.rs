use crate::packet::Packet;

// ==========================================
// 全局共享的在途包链表
// 槽位数组 + 代数号句柄，摘除/插入都是 O(1)，旧句柄不会误指新包
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    generation: u64,
}

struct Node<T> {
    packet: Packet<T>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

struct Slot<T> {
    generation: u64,
    node: Option<Node<T>>,
}

pub struct PacketList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>, // 回收站：空槽位下标
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl<T> Default for PacketList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PacketList<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.prev
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.next
    }

    pub fn get(&self, id: NodeId) -> Option<&Packet<T>> {
        self.node(id).map(|node| &node.packet)
    }

    pub fn push_front(&mut self, packet: Packet<T>) -> NodeId {
        let next = self.head;
        self.link_between(packet, None, next)
    }

    pub fn push_back(&mut self, packet: Packet<T>) -> NodeId {
        let prev = self.tail;
        self.link_between(packet, prev, None)
    }

    /// 插到 `anchor` 后面。句柄失效时原样退回包。
    pub fn insert_after(&mut self, anchor: NodeId, packet: Packet<T>) -> Result<NodeId, Packet<T>> {
        let next = match self.node(anchor) {
            Some(node) => node.next,
            None => return Err(packet),
        };
        Ok(self.link_between(packet, Some(anchor), next))
    }

    /// 插到 `anchor` 前面。句柄失效时原样退回包。
    pub fn insert_before(&mut self, anchor: NodeId, packet: Packet<T>) -> Result<NodeId, Packet<T>> {
        let prev = match self.node(anchor) {
            Some(node) => node.prev,
            None => return Err(packet),
        };
        Ok(self.link_between(packet, prev, Some(anchor)))
    }

    /// 把节点从链表里摘出来，交出包的所有权。
    pub fn detach(&mut self, id: NodeId) -> Option<Packet<T>> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation += 1;
        self.free.push(id.index);

        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.node_mut(prev) {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.node_mut(next) {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        self.len -= 1;
        Some(node.packet)
    }

    pub fn pop_front(&mut self) -> Option<Packet<T>> {
        let head = self.head?;
        self.detach(head)
    }

    pub fn pop_back(&mut self) -> Option<Packet<T>> {
        let tail = self.tail?;
        self.detach(tail)
    }

    /// 从头到尾遍历
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn alloc(&mut self, node: Node<T>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    // prev/next 必须是当前链表里相邻的两个节点 (或者到头了是 None)
    fn link_between(&mut self, packet: Packet<T>, prev: Option<NodeId>, next: Option<NodeId>) -> NodeId {
        let id = self.alloc(Node { packet, prev, next });

        match prev {
            Some(prev) => {
                if let Some(prev_node) = self.node_mut(prev) {
                    prev_node.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match next {
            Some(next) => {
                if let Some(next_node) = self.node_mut(next) {
                    next_node.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }

        self.len += 1;
        id
    }
}

pub struct Iter<'a, T> {
    list: &'a PacketList<T>,
    cursor: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Packet<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.node(self.cursor?)?;
        self.cursor = node.next;
        Some(&node.packet)
    }
}
