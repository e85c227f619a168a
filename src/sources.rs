//! Static registry of college bulletin sources.
//!
//! Each entry describes where a college's notice list lives and how its
//! relative article links resolve. The `cs` board is campus-only: its real
//! notice list (即时更新) sits behind WebVPN, with the public college news
//! page (新闻动态) serving as the degraded fallback.
//!
//! List pages are ZJU WebPlus CMS pages paginated as `list.htm`,
//! `list2.htm`, `list3.htm`, … with roughly 15 items per page.

use crate::models::{Endpoint, Source};

/// Number of list pages fetched per source by default.
pub const DEFAULT_PAGES: u32 = 2;

/// Approximate items per WebPlus list page; used for the per-source cap.
pub const ITEMS_PER_PAGE: usize = 15;

pub const SOURCES: &[Source] = &[
    Source {
        id: "sis",
        name: "外国语学院",
        public: Some(Endpoint {
            list_url: "http://www.sis.zju.edu.cn/sischinese/12577/list.htm",
            base_url: "http://www.sis.zju.edu.cn",
        }),
        gated: None,
        requires_auth: false,
    },
    Source {
        id: "cs",
        name: "计算机科学与技术学院",
        public: Some(Endpoint {
            list_url: "http://www.cs.zju.edu.cn/csen/xwdt_38564/list.htm",
            base_url: "http://www.cs.zju.edu.cn",
        }),
        gated: Some(Endpoint {
            list_url: "http://cspo.zju.edu.cn/86671/list.htm",
            base_url: "http://cspo.zju.edu.cn",
        }),
        requires_auth: true,
    },
    Source {
        id: "ckc",
        name: "竺可桢学院",
        public: Some(Endpoint {
            list_url: "http://ckc.zju.edu.cn/54005/list.htm",
            base_url: "http://ckc.zju.edu.cn",
        }),
        gated: None,
        requires_auth: false,
    },
];

/// Build the URL of the `page`-th list page: `list.htm` → `list2.htm` → …
pub fn page_url(list_url: &str, page: u32) -> String {
    if page <= 1 {
        list_url.to_string()
    } else {
        list_url.replace("/list.htm", &format!("/list{page}.htm"))
    }
}
