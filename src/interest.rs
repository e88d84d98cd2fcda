use std::num::NonZeroU8;
use std::{fmt, ops};

/// Interest used in registering and arming.
///
/// An `Interest` names the readiness classes a registration should be
/// monitored for. It is a non-empty set over readable, writable and priority
/// readiness; the smallest value is a single class.
///
/// The size of `Option<Interest>` is identical to `Interest` itself.
///
/// ```
/// use std::mem::size_of;
/// use selio::Interest;
///
/// assert_eq!(size_of::<Option<Interest>>(), size_of::<Interest>());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

// These must be unique.
const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const PRIORITY: u8 = 0b100;

/// Number of distinct interest classes, used to size permit storage.
pub(crate) const INTEREST_CLASSES: usize = 3;

impl Interest {
    /// Returns an `Interest` set representing readable interest.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Returns an `Interest` set representing writable interest.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Returns an `Interest` set representing priority (out-of-band data)
    /// interest.
    ///
    /// Maps to `EPOLLPRI` on epoll; kqueue has no equivalent filter and
    /// ignores it.
    pub const PRIORITY: Interest = Interest(unsafe { NonZeroU8::new_unchecked(PRIORITY) });

    /// Add together two `Interest`s.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    ///
    /// ```
    /// use selio::Interest;
    ///
    /// const INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);
    /// # fn silent_dead_code_warning(_: Interest) { }
    /// # silent_dead_code_warning(INTEREST)
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` from `self`, returning `None` if the set would become
    /// empty.
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    /// Returns true if the value includes readable interest.
    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    /// Returns true if the value includes writable interest.
    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    /// Returns true if the value includes priority interest.
    pub const fn is_priority(self) -> bool {
        (self.0.get() & PRIORITY) != 0
    }

    /// Returns true if `self` and `other` share at least one class.
    pub const fn intersects(self, other: Interest) -> bool {
        (self.0.get() & other.0.get()) != 0
    }

    /// Returns true if every class in `other` is in `self`.
    pub const fn contains(self, other: Interest) -> bool {
        (self.0.get() & other.0.get()) == other.0.get()
    }

    /// Iterates the single-class subsets in canonical order: readable,
    /// writable, priority.
    pub fn classes(self) -> impl Iterator<Item = Interest> {
        [Interest::READABLE, Interest::WRITABLE, Interest::PRIORITY]
            .into_iter()
            .filter(move |class| self.intersects(*class))
    }

    /// Index of a single-class interest, in canonical order.
    ///
    /// Caller must pass a single-class value.
    pub(crate) fn class_index(self) -> usize {
        debug_assert_eq!(self.0.get().count_ones(), 1);
        self.0.get().trailing_zeros() as usize
    }

    pub(crate) fn from_class_index(index: usize) -> Interest {
        debug_assert!(index < INTEREST_CLASSES);
        Interest(unsafe { NonZeroU8::new_unchecked(1 << index) })
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "WRITABLE")?;
            one = true
        }
        if self.is_priority() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "PRIORITY")?;
            one = true
        }
        debug_assert!(one, "printing empty interest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_contains() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_priority());
        assert!(both.contains(Interest::READABLE));
        assert!(!Interest::READABLE.contains(both));
    }

    #[test]
    fn remove_becomes_none_when_empty() {
        assert_eq!(Interest::READABLE.remove(Interest::READABLE), None);
        let both = Interest::READABLE.add(Interest::WRITABLE);
        assert_eq!(both.remove(Interest::WRITABLE), Some(Interest::READABLE));
    }

    #[test]
    fn canonical_class_order() {
        let all = Interest::READABLE | Interest::WRITABLE | Interest::PRIORITY;
        let classes: Vec<_> = all.classes().collect();
        assert_eq!(
            classes,
            vec![Interest::READABLE, Interest::WRITABLE, Interest::PRIORITY]
        );
        assert_eq!(Interest::READABLE.class_index(), 0);
        assert_eq!(Interest::WRITABLE.class_index(), 1);
        assert_eq!(Interest::PRIORITY.class_index(), 2);
    }
}
