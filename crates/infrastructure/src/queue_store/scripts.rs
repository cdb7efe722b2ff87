//! 队列操作的Lua脚本，保证每个操作在Redis中原子执行

/// KEYS: tasks, delayed, failed, pending(tier)
/// ARGV: id, envelope, not_before_ms, now_ms
pub(super) const PUSH: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HDEL', KEYS[3], ARGV[1])
local not_before = tonumber(ARGV[3])
if not_before and not_before > tonumber(ARGV[4]) then
  redis.call('ZADD', KEYS[2], not_before, ARGV[1])
else
  redis.call('RPUSH', KEYS[4], ARGV[1])
end
return 1
"#;

/// KEYS: tasks, delayed, leases, lease_ids,
///       pending(critical..low) 公共分区，
///       [pending(critical..low) 本Worker的私有分区]
/// ARGV: now_ms, deadline_ms, lease_id, pending_prefix
///
/// 到期的退避任务按记录中的层级和目标Worker放回对应分区。
pub(super) const POP_LEASE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local raw = redis.call('HGET', KEYS[1], id)
  if raw then
    local envelope = cjson.decode(raw)
    local key = ARGV[4] .. (envelope['tier'] or 'default')
    local target = envelope['target_worker']
    if target and target ~= cjson.null then
      key = key .. ':worker:' .. target
    end
    redis.call('RPUSH', key, id)
  end
end
local lists = {}
for i = 1, 4 do
  if #KEYS >= 12 then
    table.insert(lists, KEYS[8 + i])
  end
  table.insert(lists, KEYS[4 + i])
end
for _, list in ipairs(lists) do
  while true do
    local id = redis.call('LPOP', list)
    if not id then
      break
    end
    local raw = redis.call('HGET', KEYS[1], id)
    if raw then
      redis.call('ZADD', KEYS[3], ARGV[2], id)
      redis.call('HSET', KEYS[4], id, ARGV[3])
      return {id, raw}
    end
  end
end
return false
"#;

/// KEYS: tasks, leases, lease_ids
/// ARGV: id, lease_id
pub(super) const ACK: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], ARGV[1])
return 1
"#;

/// KEYS: tasks, leases, lease_ids, delayed, pending(tier)
/// ARGV: id, lease_id, envelope, not_before_ms, now_ms
pub(super) const RETRY: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
local not_before = tonumber(ARGV[4])
if not_before and not_before > tonumber(ARGV[5]) then
  redis.call('ZADD', KEYS[4], not_before, ARGV[1])
else
  redis.call('RPUSH', KEYS[5], ARGV[1])
end
return 1
"#;

/// KEYS: tasks, leases, lease_ids, failed
/// ARGV: id, lease_id, envelope
pub(super) const FAIL: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[3])
return 1
"#;
