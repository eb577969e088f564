use std::fmt;

use serde::Serialize;

pub const DEFAULT_MAX_ITEM_COUNT: usize = 11;
pub const DEFAULT_ENDING_ITEM_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "number")]
pub enum PageIndicator {
    Page(usize),
    Ellipsis,
}

impl PageIndicator {
    pub fn page_number(self) -> Option<usize> {
        match self {
            Self::Page(number) => Some(number),
            Self::Ellipsis => None,
        }
    }

    pub fn is_ellipsis(self) -> bool {
        matches!(self, Self::Ellipsis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationError {
    OutOfRange {
        page: usize,
        total: usize,
    },
    Configuration {
        max_item_count: usize,
        ending_item_count: usize,
        minimum: usize,
    },
}

impl fmt::Display for PaginationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { page, total } => {
                write!(f, "page {page} is not within range 1 to {total}")
            }
            Self::Configuration {
                max_item_count,
                ending_item_count,
                minimum,
            } => {
                if *ending_item_count == 0 {
                    write!(f, "ending item count needs to be at least 1")
                } else {
                    write!(
                        f,
                        "max item count {max_item_count} needs to be at least {minimum} (given ending item count {ending_item_count})"
                    )
                }
            }
        }
    }
}

impl std::error::Error for PaginationError {}

/// Which window shape a bar takes. Exactly one applies to any valid input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLayout {
    Contiguous,
    /// Close to page 1: one long leading run, one marker.
    CollapsedHead,
    CollapsedTail,
    Centered { first: usize, last: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub max_item_count: usize,
    pub ending_item_count: usize,
}

impl Default for PageWindow {
    fn default() -> Self {
        Self {
            max_item_count: DEFAULT_MAX_ITEM_COUNT,
            ending_item_count: DEFAULT_ENDING_ITEM_COUNT,
        }
    }
}

impl PageWindow {
    pub fn new(max_item_count: usize, ending_item_count: usize) -> Result<Self, PaginationError> {
        let window = Self {
            max_item_count,
            ending_item_count,
        };
        window.validate()?;
        Ok(window)
    }

    pub fn minimum_max_item_count(&self) -> usize {
        (self.ending_item_count + 1) * 2 + 1
    }

    pub fn validate(&self) -> Result<(), PaginationError> {
        let minimum = self.minimum_max_item_count();
        if self.ending_item_count == 0 || self.max_item_count < minimum {
            return Err(PaginationError::Configuration {
                max_item_count: self.max_item_count,
                ending_item_count: self.ending_item_count,
                minimum,
            });
        }
        Ok(())
    }

    pub fn classify(&self, total_page_count: usize, current_page_number: usize) -> WindowLayout {
        let max = self.max_item_count;
        let ending = self.ending_item_count;
        if total_page_count <= max {
            return WindowLayout::Contiguous;
        }

        let surrounding = max.saturating_sub(self.minimum_max_item_count());
        let items_before = surrounding / 2;
        let items_after = surrounding - items_before;
        let middle_first = current_page_number.saturating_sub(items_before);
        let middle_last = current_page_number + items_after;

        if middle_first <= ending + 2 {
            WindowLayout::CollapsedHead
        } else if middle_last + ending + 1 >= total_page_count {
            WindowLayout::CollapsedTail
        } else {
            WindowLayout::Centered {
                first: middle_first,
                last: middle_last,
            }
        }
    }

    pub fn compute(
        &self,
        total_page_count: usize,
        current_page_number: usize,
    ) -> Result<Vec<PageIndicator>, PaginationError> {
        if current_page_number == 0 || current_page_number > total_page_count {
            return Err(PaginationError::OutOfRange {
                page: current_page_number,
                total: total_page_count,
            });
        }
        self.validate()?;

        let layout = self.classify(total_page_count, current_page_number);
        Ok(self.build(layout, total_page_count))
    }

    fn build(&self, layout: WindowLayout, total: usize) -> Vec<PageIndicator> {
        let max = self.max_item_count;
        let ending = self.ending_item_count;

        let mut items = Vec::with_capacity(max.min(total));
        match layout {
            WindowLayout::Contiguous => {
                push_pages(&mut items, 1..=total);
            }
            WindowLayout::CollapsedHead => {
                push_pages(&mut items, 1..=max - ending - 1);
                items.push(PageIndicator::Ellipsis);
                push_pages(&mut items, total + 1 - ending..=total);
            }
            WindowLayout::CollapsedTail => {
                push_pages(&mut items, 1..=ending);
                items.push(PageIndicator::Ellipsis);
                push_pages(&mut items, total + ending + 2 - max..=total);
            }
            WindowLayout::Centered { first, last } => {
                push_pages(&mut items, 1..=ending);
                items.push(PageIndicator::Ellipsis);
                push_pages(&mut items, first..=last);
                items.push(PageIndicator::Ellipsis);
                push_pages(&mut items, total + 1 - ending..=total);
            }
        }
        items
    }
}

/// Page indicators for a bar of at most `max_item_count` items around `current_page_number`.
///
/// ```
/// use wnpp_core::pagination::{PageIndicator::{Ellipsis, Page}, compute};
///
/// let items = compute(100, 94, 10, 2).unwrap();
/// assert_eq!(
///     items,
///     vec![Page(1), Page(2), Ellipsis, Page(93), Page(94), Page(95), Page(96), Ellipsis, Page(99), Page(100)]
/// );
/// ```
pub fn compute(
    total_page_count: usize,
    current_page_number: usize,
    max_item_count: usize,
    ending_item_count: usize,
) -> Result<Vec<PageIndicator>, PaginationError> {
    PageWindow {
        max_item_count,
        ending_item_count,
    }
    .compute(total_page_count, current_page_number)
}

pub fn compute_with_defaults(
    total_page_count: usize,
    current_page_number: usize,
) -> Result<Vec<PageIndicator>, PaginationError> {
    PageWindow::default().compute(total_page_count, current_page_number)
}

fn push_pages(items: &mut Vec<PageIndicator>, pages: std::ops::RangeInclusive<usize>) {
    items.extend(pages.map(PageIndicator::Page));
}
