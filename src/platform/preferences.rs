//! 求职偏好 → 平台搜索地址
//!
//! 每个平台一张静态映射表，把结构化偏好翻译成该平台的查询参数。纯函数且全函数：
//! 缺失字段、表里没有的取值一律省略；没有映射表的平台返回 `about:blank`，
//! 由适配器自行导航。

use ::url::form_urlencoded;
use serde::{Deserialize, Serialize};

/// 无映射表时的初始地址
pub const BLANK_TARGET: &str = "about:blank";

/// 用户求职偏好
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPreferences {
    pub positions: Vec<String>,
    pub location: Option<String>,
    pub remote_only: bool,
    /// internship / entry / associate / mid / senior / director / executive
    pub experience: Vec<String>,
    /// full_time / part_time / contract / temporary / internship
    pub job_type: Vec<String>,
    pub salary_min: Option<u32>,
    pub salary_max: Option<u32>,
    /// past_24h / past_week / past_month
    pub date_posted: Option<String>,
    /// seed / series_a / series_b / series_c / growth / public
    pub company_stage: Vec<String>,
}

struct FieldMap {
    param: &'static str,
    values: &'static [(&'static str, &'static str)],
}

enum SalaryParam {
    Min(&'static str),
    Range(&'static str, &'static str),
    /// LinkedIn 按 2 万一档分桶（1..=9）
    Bucket(&'static str),
}

struct QueryTable {
    platform: &'static str,
    base: &'static str,
    keywords: &'static str,
    location: Option<&'static str>,
    remote: Option<(&'static str, &'static str)>,
    experience: Option<FieldMap>,
    job_type: Option<FieldMap>,
    date_posted: Option<FieldMap>,
    company_stage: Option<FieldMap>,
    salary: SalaryParam,
}

const TABLES: &[QueryTable] = &[
    QueryTable {
        platform: "linkedin",
        base: "https://www.linkedin.com/jobs/search/",
        keywords: "keywords",
        location: Some("location"),
        remote: Some(("f_WT", "2")),
        experience: Some(FieldMap {
            param: "f_E",
            values: &[
                ("internship", "1"),
                ("entry", "2"),
                ("associate", "3"),
                ("mid", "4"),
                ("senior", "4"),
                ("director", "5"),
                ("executive", "6"),
            ],
        }),
        job_type: Some(FieldMap {
            param: "f_JT",
            values: &[
                ("full_time", "F"),
                ("part_time", "P"),
                ("contract", "C"),
                ("temporary", "T"),
                ("internship", "I"),
            ],
        }),
        date_posted: Some(FieldMap {
            param: "f_TPR",
            values: &[
                ("past_24h", "r86400"),
                ("past_week", "r604800"),
                ("past_month", "r2592000"),
            ],
        }),
        company_stage: None,
        salary: SalaryParam::Bucket("f_SB2"),
    },
    QueryTable {
        platform: "indeed",
        base: "https://www.indeed.com/jobs",
        keywords: "q",
        location: Some("l"),
        remote: Some(("sc", "0kf:attr(DSQF7);")),
        experience: Some(FieldMap {
            param: "explvl",
            values: &[
                ("entry", "ENTRY_LEVEL"),
                ("mid", "MID_LEVEL"),
                ("senior", "SENIOR_LEVEL"),
            ],
        }),
        job_type: Some(FieldMap {
            param: "jt",
            values: &[
                ("full_time", "fulltime"),
                ("part_time", "parttime"),
                ("contract", "contract"),
                ("temporary", "temporary"),
                ("internship", "internship"),
            ],
        }),
        date_posted: Some(FieldMap {
            param: "fromage",
            values: &[("past_24h", "1"), ("past_week", "7"), ("past_month", "30")],
        }),
        company_stage: None,
        salary: SalaryParam::Min("salary"),
    },
    QueryTable {
        platform: "glassdoor",
        base: "https://www.glassdoor.com/Job/jobs.htm",
        keywords: "sc.keyword",
        location: Some("locKeyword"),
        remote: Some(("remoteWorkType", "1")),
        experience: Some(FieldMap {
            param: "seniorityType",
            values: &[
                ("internship", "internship"),
                ("entry", "entrylevel"),
                ("mid", "midseniorlevel"),
                ("senior", "midseniorlevel"),
                ("director", "director"),
                ("executive", "executive"),
            ],
        }),
        job_type: Some(FieldMap {
            param: "jobType",
            values: &[
                ("full_time", "fulltime"),
                ("part_time", "parttime"),
                ("contract", "contract"),
                ("temporary", "temporary"),
                ("internship", "internship"),
            ],
        }),
        date_posted: Some(FieldMap {
            param: "fromAge",
            values: &[("past_24h", "1"), ("past_week", "7"), ("past_month", "30")],
        }),
        company_stage: None,
        salary: SalaryParam::Range("minSalary", "maxSalary"),
    },
    QueryTable {
        platform: "ziprecruiter",
        base: "https://www.ziprecruiter.com/jobs-search",
        keywords: "search",
        location: Some("location"),
        remote: Some(("refine_by_location_type", "only_remote")),
        experience: None,
        job_type: Some(FieldMap {
            param: "refine_by_employment",
            values: &[
                ("full_time", "employment_type:full_time"),
                ("part_time", "employment_type:part_time"),
                ("contract", "employment_type:contract"),
                ("temporary", "employment_type:temporary"),
            ],
        }),
        date_posted: Some(FieldMap {
            param: "days",
            values: &[("past_24h", "1"), ("past_week", "5"), ("past_month", "30")],
        }),
        company_stage: None,
        salary: SalaryParam::Min("refine_by_salary"),
    },
    QueryTable {
        platform: "wellfound",
        base: "https://wellfound.com/jobs",
        keywords: "role",
        location: Some("location"),
        remote: Some(("remote", "true")),
        experience: None,
        job_type: Some(FieldMap {
            param: "jobTypes",
            values: &[
                ("full_time", "full-time"),
                ("contract", "contract"),
                ("internship", "internship"),
            ],
        }),
        date_posted: None,
        company_stage: Some(FieldMap {
            param: "companyStage",
            values: &[
                ("seed", "seed"),
                ("series_a", "series-a"),
                ("series_b", "series-b"),
                ("series_c", "series-c"),
                ("growth", "growth"),
                ("public", "public"),
            ],
        }),
        salary: SalaryParam::Min("salaryMin"),
    },
];

/// 统一取值写法：`Full-Time` / `full time` → `full_time`
fn canonical_value(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// 映射多值字段；未知取值丢弃，映射后去重
fn map_values(field: &FieldMap, raw: &[String]) -> Option<String> {
    let mut mapped: Vec<&str> = Vec::new();
    for value in raw {
        let key = canonical_value(value);
        if let Some((_, v)) = field.values.iter().find(|(k, _)| *k == key) {
            if !mapped.contains(v) {
                mapped.push(v);
            }
        }
    }
    (!mapped.is_empty()).then(|| mapped.join(","))
}

fn linkedin_salary_bucket(min: u32) -> u32 {
    (min / 20_000).clamp(1, 9)
}

/// 偏好 → 平台初始搜索地址
pub fn build_search_target(platform: &str, prefs: &JobPreferences) -> String {
    let Some(table) = TABLES.iter().find(|t| t.platform == platform) else {
        return BLANK_TARGET.to_string();
    };

    let mut params: Vec<(&str, String)> = Vec::new();

    let positions: Vec<&str> = prefs
        .positions
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if !positions.is_empty() {
        params.push((table.keywords, positions.join(" OR ")));
    }

    if let (Some(param), Some(location)) = (table.location, prefs.location.as_deref()) {
        let location = location.trim();
        if !location.is_empty() {
            params.push((param, location.to_string()));
        }
    }

    if prefs.remote_only {
        if let Some((param, value)) = table.remote {
            params.push((param, value.to_string()));
        }
    }

    if let Some(field) = &table.experience {
        if let Some(value) = map_values(field, &prefs.experience) {
            params.push((field.param, value));
        }
    }

    if let Some(field) = &table.job_type {
        if let Some(value) = map_values(field, &prefs.job_type) {
            params.push((field.param, value));
        }
    }

    if let (Some(field), Some(posted)) = (&table.date_posted, prefs.date_posted.as_ref()) {
        if let Some(value) = map_values(field, std::slice::from_ref(posted)) {
            params.push((field.param, value));
        }
    }

    if let Some(field) = &table.company_stage {
        if let Some(value) = map_values(field, &prefs.company_stage) {
            params.push((field.param, value));
        }
    }

    match table.salary {
        SalaryParam::Min(param) => {
            if let Some(min) = prefs.salary_min {
                params.push((param, min.to_string()));
            }
        }
        SalaryParam::Range(min_param, max_param) => {
            if let Some(min) = prefs.salary_min {
                params.push((min_param, min.to_string()));
            }
            if let Some(max) = prefs.salary_max {
                params.push((max_param, max.to_string()));
            }
        }
        SalaryParam::Bucket(param) => {
            if let Some(min) = prefs.salary_min {
                params.push((param, linkedin_salary_bucket(min).to_string()));
            }
        }
    }

    if params.is_empty() {
        return table.base.to_string();
    }
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
        .finish();
    format!("{}?{}", table.base, query)
}

/// 有映射表的平台
pub fn mapped_platforms() -> Vec<&'static str> {
    TABLES.iter().map(|t| t.platform).collect()
}
