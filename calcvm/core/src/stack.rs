use crate::error::{Result, VmError};

pub const DEFAULT_STACK_DEPTH: usize = 20;

/// Fixed-depth return-address stack for CALL/RETURN.
#[derive(Debug, Clone)]
pub struct Stack {
    entries: Vec<u16>,
    pointer: usize,
}

impl Default for Stack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_DEPTH)
    }
}

impl Stack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![0; capacity],
            pointer: 0,
        }
    }

    pub fn push(&mut self, address: u16) -> Result<()> {
        if self.is_full() {
            return Err(VmError::StackOverflow {
                capacity: self.entries.len(),
            });
        }
        self.entries[self.pointer] = address;
        self.pointer += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<u16> {
        let top = self.peek()?;
        self.pointer -= 1;
        Ok(top)
    }

    pub fn peek(&self) -> Result<u16> {
        if self.is_empty() {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.entries[self.pointer - 1])
    }

    pub fn is_empty(&self) -> bool {
        self.pointer == 0
    }

    pub fn is_full(&self) -> bool {
        self.pointer == self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.pointer
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = 0);
        self.pointer = 0;
    }

    /// Live entries, bottom first.
    pub fn entries(&self) -> &[u16] {
        &self.entries[..self.pointer]
    }

    /// Raw storage including popped slots.
    pub fn dump(&self) -> &[u16] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let mut stack = Stack::new(4);
        stack.push(3).unwrap();
        stack.push(6).unwrap();
        assert_eq!(stack.peek().unwrap(), 6);
        assert_eq!(stack.entries(), &[3, 6]);
        assert_eq!(stack.pop().unwrap(), 6);
        assert_eq!(stack.pop().unwrap(), 3);
        assert!(stack.is_empty());
    }

    #[test]
    fn overflow_at_capacity() {
        let mut stack = Stack::new(DEFAULT_STACK_DEPTH);
        for addr in 0..DEFAULT_STACK_DEPTH as u16 {
            stack.push(addr).unwrap();
        }
        assert!(stack.is_full());
        assert_eq!(
            stack.push(0xBEEF),
            Err(VmError::StackOverflow { capacity: 20 })
        );
        assert_eq!(stack.len(), DEFAULT_STACK_DEPTH);
    }

    #[test]
    fn underflow_when_empty() {
        let mut stack = Stack::default();
        assert_eq!(stack.pop(), Err(VmError::StackUnderflow));
        assert_eq!(stack.peek(), Err(VmError::StackUnderflow));
    }

    #[test]
    fn clear_zeroes_storage() {
        let mut stack = Stack::new(2);
        stack.push(0x1234).unwrap();
        stack.pop().unwrap();
        assert_eq!(stack.dump(), &[0x1234, 0]);
        stack.push(0x55).unwrap();
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(stack.dump(), &[0, 0]);
    }
}
