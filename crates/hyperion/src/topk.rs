/// A bounded min-heap holding the `k` largest items inserted so far. The
/// root is the smallest retained item, so an insert against a full heap is
/// a single root comparison. Ties keep the earlier insertion.
pub struct BoundedHeap<T> {
    k: usize,
    items: Vec<T>,
}

impl<T: Ord> BoundedHeap<T> {
    pub fn new(k: usize) -> Self {
        BoundedHeap {
            k,
            items: Vec::with_capacity(k),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn insert(&mut self, item: T) {
        if self.k == 0 {
            return;
        }
        if self.items.len() < self.k {
            self.items.push(item);
            self.sift_up(self.items.len() - 1);
        } else if item > self.items[0] {
            self.items[0] = item;
            self.sift_down(0);
        }
    }

    /// The best retained item; with a min-heap this is one of the leaves.
    pub fn max(&self) -> Option<&T> {
        let mut best: Option<&T> = None;
        for item in &self.items {
            match best {
                Some(b) if item > b => best = Some(item),
                None => best = Some(item),
                _ => {}
            }
        }
        best
    }

    /// Drain into a vector sorted best-first.
    pub fn into_sorted_desc(self) -> Vec<T> {
        let mut items = self.items;
        items.sort_unstable_by(|a, b| b.cmp(a));
        items
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.items[index] < self.items[parent] {
                self.items.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        while let Some(left) = self.items.get(index * 2 + 1) {
            let mut smallest = index;
            if left < &self.items[smallest] {
                smallest = index * 2 + 1;
            }

            if let Some(right) = self.items.get(index * 2 + 2) {
                if right < &self.items[smallest] {
                    smallest = index * 2 + 2;
                }
            }

            if smallest != index {
                self.items.swap(smallest, index);
                index = smallest;
            } else {
                break;
            }
        }
    }
}
