use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Intrusive doubly linked list. The list never allocates: every node lives
/// in memory handed to it by the caller (for the pool, the first bytes of
/// each block).
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

/// Iterator over the nodes of a [`List`]. The successor is read before a node
/// is yielded, so the caller may release the yielded node.
pub(crate) struct Nodes<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes a new node holding `data` at `addr` and links it at the front of
    /// the list.
    ///
    /// It is very important for us that, because we are the actual memory
    /// allocator, this method can not make allocations itself. Therefor, it
    /// has to receive the `addr` where this node has to be placed.
    ///
    /// **SAFETY**: Caller must guarantee that `addr` is valid for writes of a
    /// `Node<T>` and suitably aligned.
    pub unsafe fn push_front(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            node.as_ptr().write(Node {
                next: self.head,
                prev: None,
                data,
            });

            match self.head {
                Some(head) => (*head.as_ptr()).prev = Some(node),
                None => self.tail = Some(node),
            }
        }

        self.head = Some(node);
        self.len += 1;

        node
    }

    /// Same as [`List::push_front`] but links the new node right after `anchor`.
    ///
    /// **SAFETY**: `anchor` must be a node of this list.
    pub unsafe fn insert_after(
        &mut self,
        anchor: NonNull<Node<T>>,
        data: T,
        addr: NonNull<u8>,
    ) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            let next = (*anchor.as_ptr()).next;

            node.as_ptr().write(Node {
                next,
                prev: Some(anchor),
                data,
            });

            (*anchor.as_ptr()).next = Some(node);

            match next {
                Some(next) => (*next.as_ptr()).prev = Some(node),
                None => self.tail = Some(node),
            }
        }

        self.len += 1;

        node
    }

    /// Unlinks `node`. Its memory is left untouched apart from its links.
    ///
    /// **SAFETY**: `node` must be a node of this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            let prev = (*node.as_ptr()).prev;
            let next = (*node.as_ptr()).next;

            match prev {
                Some(prev) => (*prev.as_ptr()).next = next,
                None => self.head = next,
            }

            match next {
                Some(next) => (*next.as_ptr()).prev = prev,
                None => self.tail = prev,
            }

            (*node.as_ptr()).prev = None;
            (*node.as_ptr()).next = None;
        }

        self.len -= 1;
    }

    /// Repairs the links around `node` after its memory was moved (for
    /// instance by `realloc`). The node's own `prev`/`next` must still be the
    /// ones it had at its previous address.
    ///
    /// **SAFETY**: the neighbours recorded in `node` must be nodes of this list.
    pub unsafe fn relink_moved(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            match (*node.as_ptr()).prev {
                Some(prev) => (*prev.as_ptr()).next = Some(node),
                None => self.head = Some(node),
            }

            match (*node.as_ptr()).next {
                Some(next) => (*next.as_ptr()).prev = Some(node),
                None => self.tail = Some(node),
            }
        }
    }

    /// Forgets every node and makes `node` the only element of the list.
    ///
    /// **SAFETY**: `node` must point to a valid `Node<T>`.
    pub unsafe fn reset_to(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            (*node.as_ptr()).prev = None;
            (*node.as_ptr()).next = None;
        }

        self.head = Some(node);
        self.tail = Some(node);
        self.len = 1;
    }

    pub fn nodes(&self) -> Nodes<'_, T> {
        Nodes {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Nodes<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = (*node.as_ptr()).next;
        }
        self.remaining = self.remaining.saturating_sub(1);

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
