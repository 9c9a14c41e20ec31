/// Split an application argument string on commas.
///
/// Commas inside double quotes, parentheses or brackets do not split;
/// surrounding double quotes are stripped from each argument. An empty input
/// yields no arguments (not one empty argument).
pub fn split_args(data: &str) -> Vec<String> {
    let mut out = Vec::new();
    if data.is_empty() {
        return out;
    }

    let mut cur = String::new();
    let mut depth = 0i32;
    let mut in_quote = false;

    for c in data.chars() {
        match c {
            '"' => {
                in_quote = !in_quote;
                cur.push(c);
            }
            '(' | '[' if !in_quote => {
                depth += 1;
                cur.push(c);
            }
            ')' | ']' if !in_quote => {
                depth -= 1;
                cur.push(c);
            }
            ',' if !in_quote && depth <= 0 => {
                out.push(finish(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    out.push(finish(&mut cur));
    out
}

fn finish(cur: &mut String) -> String {
    let s = std::mem::take(cur);
    let trimmed = s.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.to_owned()
}
