// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
From requested pages to a sorted list of work.

* [`feedback`] reduces the GPU feedback buffer to a [`unique_page_list::UniquePageList`].
* [`gather`] resolves unique pages against the registry into a
  [`request_list::RequestList`].
* [`request_list::RequestList::sort_and_clamp`] applies the upload budget.
*/

pub mod feedback;
pub(crate) mod gather;
pub mod request_list;
pub mod unique_page_list;
