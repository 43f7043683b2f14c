use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    config::PaginationConfig,
    error::{Error, Result},
};

/// Raw page parameters as they arrive on the query string.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    /// Page number, starting at 1
    pub page: Option<u32>,
    /// Number of records per page
    pub page_size: Option<u32>,
    /// `false` to return every record in one response
    pub paginate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub paginate: bool,
}

impl PageQuery {
    pub fn resolve(&self, config: PaginationConfig) -> Result<PageRequest> {
        let paginate = !self
            .paginate
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("false"));
        let page = self.page.unwrap_or(1);
        if page == 0 {
            return Err(Error::Validation("page must start at 1".into()));
        }
        let page_size = match self.page_size {
            None | Some(0) => config.default_page_size,
            Some(size) => size.min(config.max_page_size),
        };
        Ok(PageRequest {
            page,
            page_size,
            paginate,
        })
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: PaginationConfig::default().default_page_size,
            paginate: true,
        }
    }
}

impl PageRequest {
    pub fn unpaged() -> Self {
        Self {
            paginate: false,
            ..Self::default()
        }
    }

    /// `LIMIT` value; `-1` is sqlite for "no limit".
    pub fn limit(&self) -> i64 {
        if self.paginate {
            self.page_size as i64
        } else {
            -1
        }
    }

    pub fn offset(&self) -> i64 {
        if self.paginate {
            (self.page as i64 - 1) * self.page_size as i64
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Page<T> {
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<u32>,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    /// A page past the last one is an error, except the first page of an
    /// empty result set.
    pub fn new(request: PageRequest, count: i64, results: Vec<T>) -> Result<Self> {
        if !request.paginate {
            return Ok(Self {
                count,
                next: None,
                previous: None,
                results,
            });
        }
        if request.page > 1 && request.offset() >= count {
            return Err(Error::NotFound("page"));
        }
        let next = (request.offset() + (results.len() as i64) < count).then(|| request.page + 1);
        let previous = (request.page > 1).then(|| request.page - 1);
        Ok(Self {
            count,
            next,
            previous,
            results,
        })
    }
}
