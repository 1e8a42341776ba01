use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use scheduler_core::{Result, Schedule as ScheduleDefinition, SchedulerError};

/// 预览默认返回的触发次数
pub const DEFAULT_PREVIEW_COUNT: usize = 5;

/// 调度计算所在的时区
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleZone {
    /// IANA 时区，夏令时按规则切换
    Named(Tz),
    Fixed(FixedOffset),
}

impl ScheduleZone {
    pub fn utc() -> Self {
        Self::Fixed(Utc.fix())
    }

    /// 指定时刻相对 UTC 的偏移秒数
    pub fn offset_seconds_at(&self, at: DateTime<Utc>) -> i32 {
        match self {
            Self::Named(tz) => tz
                .offset_from_utc_datetime(&at.naive_utc())
                .fix()
                .local_minus_utc(),
            Self::Fixed(offset) => offset.local_minus_utc(),
        }
    }
}

/// CRON表达式解析和调度工具
///
/// 支持 6/7 段的 Quartz 风格表达式，`?` 视为"任意"。
/// 触发时间按所在时区计算，统一以 UTC 返回，并限定在 `[start_time, end_time]` 内。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
    zone: ScheduleZone,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl CronScheduler {
    /// 创建新的CRON调度器（UTC，无有效期限制）
    pub fn new(cron_expr: &str) -> Result<Self> {
        let schedule = parse_cron(cron_expr)?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
            zone: ScheduleZone::utc(),
            start_time: None,
            end_time: None,
        })
    }

    /// 按调度定义的表达式、时区和有效期构造
    pub fn for_schedule(definition: &ScheduleDefinition) -> Result<Self> {
        Ok(Self::new(&definition.crontab)?
            .with_timezone(&definition.timezone_id)?
            .with_bounds(Some(definition.start_time), Some(definition.end_time)))
    }

    pub fn with_timezone(mut self, timezone_id: &str) -> Result<Self> {
        self.zone = parse_timezone(timezone_id)?;
        Ok(self)
    }

    pub fn with_bounds(
        mut self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// 严格晚于 `after` 且在有效期内的触发时间
    pub fn iter_after(&self, after: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        // 有效期尚未开始时从开始时间的前一秒起算，保证开始时间本身可以命中
        let from = match self.start_time {
            Some(start) if start > after => start - Duration::seconds(1),
            _ => after,
        };
        let start_time = self.start_time;
        let end_time = self.end_time;

        let fire_times: Box<dyn Iterator<Item = DateTime<Utc>> + '_> = match self.zone {
            ScheduleZone::Named(tz) => Box::new(
                self.schedule
                    .after(&from.with_timezone(&tz))
                    .map(|t| t.with_timezone(&Utc)),
            ),
            ScheduleZone::Fixed(offset) => Box::new(
                self.schedule
                    .after(&from.with_timezone(&offset))
                    .map(|t| t.with_timezone(&Utc)),
            ),
        };

        fire_times
            .filter(move |t| *t > after && start_time.map_or(true, |start| *t >= start))
            .take_while(move |t| end_time.map_or(true, |end| *t <= end))
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.iter_after(after).next()
    }

    /// 获取指定时间之后的多个执行时间
    pub fn upcoming_times(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.iter_after(after).take(count).collect()
    }

    /// `(from_exclusive, to_inclusive]` 区间内的触发时间，按时间顺序，最多 `limit` 个
    pub fn fire_times_between(
        &self,
        from_exclusive: DateTime<Utc>,
        to_inclusive: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.iter_after(from_exclusive)
            .take_while(|t| *t <= to_inclusive)
            .take(limit)
            .collect()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> Result<()> {
        parse_cron(cron_expr)?;
        Ok(())
    }

}

/// 预览接下来的触发时间，不读写任何状态
pub fn preview_next_fire_times(
    cron_expr: &str,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    timezone_id: &str,
    now: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let scheduler = CronScheduler::new(cron_expr)?
        .with_timezone(timezone_id)?
        .with_bounds(start_time, end_time);
    Ok(scheduler.upcoming_times(now, count))
}

fn parse_cron(cron_expr: &str) -> Result<Schedule> {
    let normalized = normalize_expression(cron_expr);
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: cron_expr.to_string(),
        message: e.to_string(),
    })
}

/// `?` 换成 `*`；5 段的 Unix 风格表达式补上秒字段
fn normalize_expression(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr
        .split_whitespace()
        .map(|field| if field == "?" { "*" } else { field })
        .collect();

    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// 解析时区标识
///
/// 先按 IANA 名称解析（`Asia/Shanghai`、`Europe/Berlin`），
/// 再接受 `UTC`、`Z` 以及 `+08:00`、`-0530`、`+08`、`UTC+8` 这类固定偏移。
pub fn parse_timezone(timezone_id: &str) -> Result<ScheduleZone> {
    let id = timezone_id.trim();
    let invalid = || SchedulerError::InvalidSchedule(format!("不支持的时区: {timezone_id}"));

    if id.is_empty() || matches!(id.to_ascii_uppercase().as_str(), "UTC" | "Z") {
        return Ok(ScheduleZone::utc());
    }
    if let Ok(tz) = id.parse::<Tz>() {
        return Ok(ScheduleZone::Named(tz));
    }

    let offset = id
        .strip_prefix("UTC")
        .or_else(|| id.strip_prefix("GMT"))
        .unwrap_or(id);

    let (sign, digits) = match offset.as_bytes().first() {
        Some(b'+') => (1, &offset[1..]),
        Some(b'-') => (-1, &offset[1..]),
        _ => return Err(invalid()),
    };

    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>().map_err(|_| invalid())?, 0)
    } else {
        let split = digits.len() - 2;
        (
            digits[..split].parse::<i32>().map_err(|_| invalid())?,
            digits[split..].parse::<i32>().map_err(|_| invalid())?,
        )
    };

    if hours > 14 || minutes >= 60 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(ScheduleZone::Fixed)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("0 0 * * * ?"), "0 0 * * * *");
        assert_eq!(normalize_expression("0 0 * * * ? *"), "0 0 * * * * *");
        assert_eq!(normalize_expression("*/5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn test_parse_timezone() {
        let at = Utc::now();
        let offset = |id: &str| parse_timezone(id).unwrap().offset_seconds_at(at);

        assert_eq!(offset("UTC"), 0);
        assert_eq!(offset("Z"), 0);
        assert_eq!(offset("+08:00"), 8 * 3600);
        assert_eq!(offset("+08"), 8 * 3600);
        assert_eq!(offset("-0530"), -(5 * 3600 + 30 * 60));
        assert_eq!(offset("UTC+8"), 8 * 3600);
        assert_eq!(offset("Asia/Shanghai"), 8 * 3600);
        assert_eq!(parse_timezone("Asia/Shanghai").unwrap(), ScheduleZone::Named(Tz::Asia__Shanghai));
        assert!(parse_timezone("Mars/Base").is_err());
        assert!(parse_timezone("+25:00").is_err());
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        // 纽约 2024-03-10 切换到夏令时，本地 09:00 从 UTC 14:00 变为 13:00
        let scheduler = CronScheduler::new("0 0 9 * * ?")
            .unwrap()
            .with_timezone("America/New_York")
            .unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 8, 15, 0, 0).unwrap();
        let times = scheduler.upcoming_times(from, 3);

        assert_eq!(times[0], Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap());
        assert_eq!(times[1], Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap());
        assert_eq!(times[2], Utc.with_ymd_and_hms(2024, 3, 11, 13, 0, 0).unwrap());
    }
}
