use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tokio::fs;
use uuid::Uuid;

use crate::{
    config::LanguageConfig,
    core::{
        domain::{Artifact, ArtifactKind, ExecutionOutcome, InputMode, Language, ResourceProfile},
        errors::{PrepareError, SandboxError},
        traits::{
            executor::{LanguageExecutor, ProgramExit},
            sandbox::{MemoryLedger, Sandbox, SandboxCommand},
        },
    },
    languages::{exit_class, preparation_result},
};

const EXECUTABLE_FILE: &str = "solution";
const HARNESS_HEADER: &str = "harness.hpp";
const HARNESS_MAIN: &str = "harness_main.cpp";
const OBJECT_FILE: &str = "solution.o";
const PROTOTYPES_FILE: &str = "solution.proto";
/// The harness is C++ for both languages.
const HARNESS_FLAGS: [&str; 3] = ["-std=c++17", "-O2", "-pipe"];
/// A `main` in an args-mode submission is renamed out of the way.
const USER_MAIN: &str = "codejudge_user_main";
/// libstdc++'s report for an uncaught allocation failure.
const FATAL_OOM: &str = "std::bad_alloc";

/// Args-mode harness shared by C and C++. It decodes the JSON argument
/// array from stdin, calls the entry point with the solution's stdout
/// pointed at stderr, and writes the JSON result as the only stdout line.
///
/// A raw pointer followed by an integer is an array and its length; the
/// length is filled in and takes no JSON argument. A function returning
/// an array pointer reports its length through a trailing `int*`.
/// `char*` parameters and results are strings.
const HARNESS: &str = r##"#pragma once
#include <cerrno>
#include <cmath>
#include <cstddef>
#include <cstdint>
#include <cstdio>
#include <cstdlib>
#include <cstring>
#include <iostream>
#include <iterator>
#include <limits>
#include <memory>
#include <new>
#include <stdexcept>
#include <string>
#include <tuple>
#include <type_traits>
#include <utility>
#include <vector>
#include <unistd.h>

namespace codejudge {

constexpr int EXCEPTION_EXIT = 1;
constexpr int MEMORY_EXIT = 4;

struct Json {
  enum Kind { Null, Bool, Number, String, Array, Object } kind = Null;
  bool boolean = false;
  std::string text;
  std::vector<Json> items;
  std::vector<std::pair<std::string, Json>> fields;
};

[[noreturn]] inline void mismatch(const char* wanted) {
  throw std::invalid_argument(std::string("argument is not a valid ") + wanted);
}

class Parser {
 public:
  explicit Parser(const std::string& src) : s_(src) {}

  Json document() {
    Json v = value();
    skip();
    if (i_ != s_.size()) fail("trailing characters");
    return v;
  }

 private:
  const std::string& s_;
  std::size_t i_ = 0;

  [[noreturn]] void fail(const char* what) {
    throw std::invalid_argument(std::string("invalid JSON arguments: ") + what);
  }

  void skip() {
    while (i_ < s_.size() && (s_[i_] == ' ' || s_[i_] == '\t' || s_[i_] == '\n' || s_[i_] == '\r')) ++i_;
  }

  bool eat(char c) {
    skip();
    if (i_ < s_.size() && s_[i_] == c) {
      ++i_;
      return true;
    }
    return false;
  }

  void expect(char c) {
    if (!eat(c)) fail("unexpected character");
  }

  bool word(const char* w) {
    std::size_t n = std::strlen(w);
    if (s_.compare(i_, n, w) != 0) return false;
    i_ += n;
    return true;
  }

  static bool numeric(char c) {
    return (c >= '0' && c <= '9') || c == '-' || c == '+' || c == '.' || c == 'e' || c == 'E';
  }

  Json value() {
    skip();
    if (i_ >= s_.size()) fail("unexpected end");
    Json v;
    char c = s_[i_];
    if (c == '[') {
      ++i_;
      v.kind = Json::Array;
      if (eat(']')) return v;
      do {
        v.items.push_back(value());
      } while (eat(','));
      expect(']');
    } else if (c == '{') {
      ++i_;
      v.kind = Json::Object;
      if (eat('}')) return v;
      do {
        skip();
        if (i_ >= s_.size() || s_[i_] != '"') fail("expected key");
        std::string key = string();
        expect(':');
        v.fields.emplace_back(key, value());
      } while (eat(','));
      expect('}');
    } else if (c == '"') {
      v.kind = Json::String;
      v.text = string();
    } else if (word("true")) {
      v.kind = Json::Bool;
      v.boolean = true;
    } else if (word("false")) {
      v.kind = Json::Bool;
    } else if (word("null")) {
      v.kind = Json::Null;
    } else {
      std::size_t start = i_;
      while (i_ < s_.size() && numeric(s_[i_])) ++i_;
      if (start == i_) fail("unexpected character");
      v.kind = Json::Number;
      v.text = s_.substr(start, i_ - start);
    }
    return v;
  }

  unsigned hex4() {
    if (i_ + 4 > s_.size()) fail("bad escape");
    unsigned cp = 0;
    for (int k = 0; k < 4; ++k) {
      char h = s_[i_++];
      cp <<= 4;
      if (h >= '0' && h <= '9') {
        cp |= static_cast<unsigned>(h - '0');
      } else if (h >= 'a' && h <= 'f') {
        cp |= static_cast<unsigned>(h - 'a' + 10);
      } else if (h >= 'A' && h <= 'F') {
        cp |= static_cast<unsigned>(h - 'A' + 10);
      } else {
        fail("bad escape");
      }
    }
    return cp;
  }

  static void utf8(std::string& out, unsigned cp) {
    if (cp < 0x80) {
      out += static_cast<char>(cp);
    } else if (cp < 0x800) {
      out += static_cast<char>(0xC0 | (cp >> 6));
      out += static_cast<char>(0x80 | (cp & 0x3F));
    } else if (cp < 0x10000) {
      out += static_cast<char>(0xE0 | (cp >> 12));
      out += static_cast<char>(0x80 | ((cp >> 6) & 0x3F));
      out += static_cast<char>(0x80 | (cp & 0x3F));
    } else {
      out += static_cast<char>(0xF0 | (cp >> 18));
      out += static_cast<char>(0x80 | ((cp >> 12) & 0x3F));
      out += static_cast<char>(0x80 | ((cp >> 6) & 0x3F));
      out += static_cast<char>(0x80 | (cp & 0x3F));
    }
  }

  std::string string() {
    ++i_;
    std::string out;
    while (true) {
      if (i_ >= s_.size()) fail("unterminated string");
      char c = s_[i_++];
      if (c == '"') return out;
      if (c != '\\') {
        out += c;
        continue;
      }
      if (i_ >= s_.size()) fail("unterminated string");
      char e = s_[i_++];
      switch (e) {
        case '"':
        case '\\':
        case '/':
          out += e;
          break;
        case 'b':
          out += '\b';
          break;
        case 'f':
          out += '\f';
          break;
        case 'n':
          out += '\n';
          break;
        case 'r':
          out += '\r';
          break;
        case 't':
          out += '\t';
          break;
        case 'u': {
          unsigned cp = hex4();
          if (cp >= 0xD800 && cp < 0xDC00 && i_ + 1 < s_.size() && s_[i_] == '\\' && s_[i_ + 1] == 'u') {
            i_ += 2;
            unsigned low = hex4();
            if (low < 0xDC00 || low > 0xDFFF) fail("bad surrogate pair");
            cp = 0x10000 + ((cp - 0xD800) << 10) + (low - 0xDC00);
          }
          utf8(out, cp);
          break;
        }
        default:
          fail("bad escape");
      }
    }
  }
};

inline void write_string(std::string& out, const std::string& s) {
  out += '"';
  for (unsigned char c : s) {
    switch (c) {
      case '"':
        out += "\\\"";
        break;
      case '\\':
        out += "\\\\";
        break;
      case '\n':
        out += "\\n";
        break;
      case '\r':
        out += "\\r";
        break;
      case '\t':
        out += "\\t";
        break;
      default:
        if (c < 0x20) {
          char buf[8];
          std::snprintf(buf, sizeof buf, "\\u%04x", c);
          out += buf;
        } else {
          out += static_cast<char>(c);
        }
    }
  }
  out += '"';
}

template <typename T, typename = void>
struct Codec {
  static_assert(sizeof(T) == 0, "unsupported parameter or return type for args mode");
};

template <>
struct Codec<bool> {
  static bool decode(const Json& v) {
    if (v.kind != Json::Bool) mismatch("boolean");
    return v.boolean;
  }
  static void encode(std::string& out, bool b) { out += b ? "true" : "false"; }
};

template <>
struct Codec<char> {
  static char decode(const Json& v) {
    if (v.kind != Json::String || v.text.size() != 1) mismatch("single-character string");
    return v.text[0];
  }
  static void encode(std::string& out, char c) { write_string(out, std::string(1, c)); }
};

template <typename T>
struct Codec<T, std::enable_if_t<std::is_integral<T>::value && !std::is_same<T, bool>::value &&
                                 !std::is_same<T, char>::value>> {
  static T decode(const Json& v) {
    if (v.kind != Json::Number) mismatch("integer");
    errno = 0;
    char* end = nullptr;
    if constexpr (std::is_signed<T>::value) {
      long long n = std::strtoll(v.text.c_str(), &end, 10);
      if (errno != 0 || *end != '\0' || n < static_cast<long long>(std::numeric_limits<T>::min()) ||
          n > static_cast<long long>(std::numeric_limits<T>::max())) {
        mismatch("integer in range");
      }
      return static_cast<T>(n);
    } else {
      if (v.text[0] == '-') mismatch("non-negative integer");
      unsigned long long n = std::strtoull(v.text.c_str(), &end, 10);
      if (errno != 0 || *end != '\0' || n > static_cast<unsigned long long>(std::numeric_limits<T>::max())) {
        mismatch("integer in range");
      }
      return static_cast<T>(n);
    }
  }
  static void encode(std::string& out, T n) { out += std::to_string(n); }
};

template <typename T>
struct Codec<T, std::enable_if_t<std::is_floating_point<T>::value>> {
  static T decode(const Json& v) {
    if (v.kind != Json::Number) mismatch("number");
    char* end = nullptr;
    long double n = std::strtold(v.text.c_str(), &end);
    if (*end != '\0') mismatch("number");
    return static_cast<T>(n);
  }
  static void encode(std::string& out, T n) {
    if (!std::isfinite(n)) {
      out += "null";
      return;
    }
    char buf[64];
    for (int precision = std::numeric_limits<T>::digits10;; ++precision) {
      std::snprintf(buf, sizeof buf, "%.*Lg", precision, static_cast<long double>(n));
      if (static_cast<T>(std::strtold(buf, nullptr)) == n || precision >= std::numeric_limits<T>::max_digits10) break;
    }
    out += buf;
  }
};

template <>
struct Codec<std::string> {
  static std::string decode(const Json& v) {
    if (v.kind != Json::String) mismatch("string");
    return v.text;
  }
  static void encode(std::string& out, const std::string& s) { write_string(out, s); }
};

template <typename T, typename A>
struct Codec<std::vector<T, A>> {
  static std::vector<T, A> decode(const Json& v) {
    if (v.kind != Json::Array) mismatch("array");
    std::vector<T, A> out;
    out.reserve(v.items.size());
    for (const Json& item : v.items) out.push_back(Codec<T>::decode(item));
    return out;
  }
  static void encode(std::string& out, const std::vector<T, A>& items) {
    out += '[';
    for (std::size_t k = 0; k < items.size(); ++k) {
      if (k != 0) out += ',';
      Codec<T>::encode(out, items[k]);
    }
    out += ']';
  }
};

enum class Kind { Value, Integer, Array };
enum class Role { Json, Length, ReturnSize };

template <typename V>
void set_integer(V& target, std::size_t n) {
  if constexpr (std::is_integral<V>::value) {
    target = static_cast<V>(n);
  } else {
    throw std::logic_error("length parameter is not an integer");
  }
}

// Storage for one parameter, decoded through Codec.
template <typename P, typename = void>
struct Slot {
  using Value = std::remove_cv_t<std::remove_reference_t<P>>;
  static constexpr Kind kind =
      std::is_integral<Value>::value && !std::is_same<Value, bool>::value && !std::is_same<Value, char>::value
          ? Kind::Integer
          : Kind::Value;
  Value value{};

  void load(const Json& v) { value = Codec<Value>::decode(v); }
  void set_length(std::size_t n) { set_integer(value, n); }
  void mark_output() { throw std::logic_error("size output is not a pointer"); }
  std::size_t length() const { return 0; }
  long long output_value() const { return 0; }
  decltype(auto) get() { return std::forward<P>(value); }
};

// Numeric array passed as a pointer, or the size output of an array result.
template <typename T>
struct Slot<T*, std::enable_if_t<std::is_arithmetic<T>::value && !std::is_same<std::remove_cv_t<T>, char>::value>> {
  using Elem = std::remove_cv_t<T>;
  static constexpr Kind kind = Kind::Array;
  std::unique_ptr<Elem[]> data;
  std::size_t size = 0;
  Elem scalar{};
  bool output = false;

  void load(const Json& v) {
    if (v.kind == Json::Null) return;
    if (v.kind != Json::Array) mismatch("array");
    size = v.items.size();
    data.reset(new Elem[size == 0 ? 1 : size]());
    for (std::size_t k = 0; k < size; ++k) data[k] = Codec<Elem>::decode(v.items[k]);
  }
  void set_length(std::size_t) { throw std::logic_error("length parameter is a pointer"); }
  void mark_output() { output = true; }
  std::size_t length() const { return size; }
  long long output_value() const { return static_cast<long long>(scalar); }
  T* get() { return output ? &scalar : data.get(); }
};

// NUL-terminated string; JSON null passes a null pointer.
template <typename T>
struct Slot<T*, std::enable_if_t<std::is_same<std::remove_cv_t<T>, char>::value>> {
  static constexpr Kind kind = Kind::Value;
  std::string text;
  bool null = false;

  void load(const Json& v) {
    if (v.kind == Json::Null) {
      null = true;
      return;
    }
    text = Codec<std::string>::decode(v);
  }
  void set_length(std::size_t) { throw std::logic_error("length parameter is a string"); }
  void mark_output() { throw std::logic_error("size output is a string"); }
  std::size_t length() const { return text.size(); }
  long long output_value() const { return 0; }
  T* get() { return null ? nullptr : &text[0]; }
};

template <typename R>
constexpr bool returns_array() {
  using V = std::remove_cv_t<std::remove_reference_t<R>>;
  if constexpr (std::is_pointer<V>::value) {
    using T = std::remove_cv_t<std::remove_pointer_t<V>>;
    return std::is_arithmetic<T>::value && !std::is_same<T, char>::value;
  } else {
    return false;
  }
}

inline std::vector<Role> assign_roles(const Kind* kinds, std::size_t count, bool array_result) {
  std::vector<Role> roles(count, Role::Json);
  for (std::size_t k = 0; k < count; ++k) {
    if (array_result && k + 1 == count && kinds[k] == Kind::Array) {
      roles[k] = Role::ReturnSize;
    } else if (k > 0 && kinds[k] == Kind::Integer && kinds[k - 1] == Kind::Array && roles[k - 1] == Role::Json) {
      roles[k] = Role::Length;
    }
  }
  return roles;
}

template <typename R>
void encode_result(std::string& out, const R& result, const long long* size) {
  using V = std::remove_cv_t<std::remove_reference_t<R>>;
  if constexpr (std::is_pointer<V>::value) {
    using T = std::remove_cv_t<std::remove_pointer_t<V>>;
    if (result == nullptr) {
      out += "null";
      return;
    }
    if constexpr (std::is_same<T, char>::value) {
      write_string(out, std::string(result));
    } else {
      if (size == nullptr) throw std::logic_error("array result needs a trailing int* size parameter");
      if (*size < 0) throw std::length_error("negative result size");
      out += '[';
      for (long long k = 0; k < *size; ++k) {
        if (k != 0) out += ',';
        Codec<T>::encode(out, result[k]);
      }
      out += ']';
    }
  } else {
    Codec<V>::encode(out, result);
  }
}

// Points fd 1 at stderr while the solution runs.
class StdoutToStderr {
 public:
  StdoutToStderr() {
    std::cout.flush();
    std::fflush(stdout);
    saved_ = ::dup(1);
    if (saved_ >= 0) ::dup2(2, 1);
  }
  ~StdoutToStderr() { restore(); }
  StdoutToStderr(const StdoutToStderr&) = delete;
  StdoutToStderr& operator=(const StdoutToStderr&) = delete;

  void restore() {
    if (saved_ < 0) return;
    std::cout.flush();
    std::fflush(stdout);
    ::dup2(saved_, 1);
    ::close(saved_);
    saved_ = -1;
  }

 private:
  int saved_ = -1;
};

template <typename R, typename... Params, std::size_t... I>
int invoke(R (*fn)(Params...), const Json& args, std::index_sequence<I...>) {
  std::tuple<Slot<Params>...> slots;
  const Kind kinds[] = {Slot<Params>::kind..., Kind::Value};
  const std::vector<Role> roles = assign_roles(kinds, sizeof...(Params), returns_array<R>());

  std::size_t wanted = 0;
  for (Role role : roles) wanted += role == Role::Json ? 1 : 0;
  if (args.items.size() != wanted) {
    throw std::invalid_argument("expected " + std::to_string(wanted) + " arguments, got " +
                                std::to_string(args.items.size()));
  }

  std::size_t next = 0;
  std::size_t last_length = 0;
  auto load = [&](auto& slot, std::size_t k) {
    switch (roles[k]) {
      case Role::Json:
        slot.load(args.items[next++]);
        break;
      case Role::Length:
        slot.set_length(last_length);
        break;
      case Role::ReturnSize:
        slot.mark_output();
        break;
    }
    last_length = slot.length();
  };
  (load(std::get<I>(slots), I), ...);

  std::string out;
  StdoutToStderr redirect;
  if constexpr (std::is_void<R>::value) {
    fn(std::get<I>(slots).get()...);
    redirect.restore();
    out = "null";
  } else {
    auto&& result = fn(std::get<I>(slots).get()...);
    redirect.restore();
    long long size = 0;
    bool sized = false;
    auto read = [&](auto& slot, std::size_t k) {
      if (roles[k] == Role::ReturnSize) {
        size = slot.output_value();
        sized = true;
      }
    };
    (read(std::get<I>(slots), I), ...);
    encode_result(out, result, sized ? &size : nullptr);
  }
  out += '\n';
  std::fwrite(out.data(), 1, out.size(), stdout);
  std::fflush(stdout);
  return 0;
}

template <typename R, typename... Params>
int run(R (*fn)(Params...)) {
  try {
    std::string input((std::istreambuf_iterator<char>(std::cin)), std::istreambuf_iterator<char>());
    Json args = Parser(input).document();
    if (args.kind != Json::Array) throw std::invalid_argument("arguments must be a JSON array");
    return invoke(fn, args, std::index_sequence_for<Params...>{});
  } catch (const std::bad_alloc& e) {
    std::fprintf(stderr, "%s\n", e.what());
    return MEMORY_EXIT;
  } catch (const std::exception& e) {
    std::fprintf(stderr, "uncaught exception: %s\n", e.what());
    return EXCEPTION_EXIT;
  } catch (...) {
    std::fprintf(stderr, "uncaught exception\n");
    return EXCEPTION_EXIT;
  }
}

}  // namespace codejudge
"##;

/// Compiles C or C++ once per submission with the GNU toolchain. In
/// `stdin` mode the submission is a whole program; in `args` mode it is
/// linked under [`HARNESS`].
#[derive(Debug)]
pub struct GccExecutor {
    sandbox: Arc<dyn Sandbox>,
    language: Language,
    compiler: PathBuf,
    source_file: &'static str,
    flags: Vec<String>,
    compile_limits: ResourceProfile,
}

impl GccExecutor {
    pub fn cpp(sandbox: Arc<dyn Sandbox>, config: &LanguageConfig, compile_limits: ResourceProfile) -> Self {
        Self::new(
            sandbox,
            Language::Cpp,
            config.program.clone().unwrap_or_else(|| PathBuf::from("g++")),
            "solution.cpp",
            HARNESS_FLAGS,
            config,
            compile_limits,
        )
    }

    pub fn c(sandbox: Arc<dyn Sandbox>, config: &LanguageConfig, compile_limits: ResourceProfile) -> Self {
        Self::new(
            sandbox,
            Language::C,
            config.program.clone().unwrap_or_else(|| PathBuf::from("gcc")),
            "solution.c",
            ["-std=c11", "-O2", "-pipe"],
            config,
            compile_limits,
        )
    }

    fn new(
        sandbox: Arc<dyn Sandbox>,
        language: Language,
        compiler: PathBuf,
        source_file: &'static str,
        flags: [&str; 3],
        config: &LanguageConfig,
        compile_limits: ResourceProfile,
    ) -> Self {
        let mut flags: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        flags.extend(config.extra_args.iter().cloned());
        Self {
            sandbox,
            language,
            compiler,
            source_file,
            flags,
            compile_limits,
        }
    }

    fn toolchain(&self, workspace: &Path) -> SandboxCommand {
        SandboxCommand::new(&self.compiler, workspace).with_address_space_limit(true)
    }

    /// Whole program straight to an executable. Relative names keep
    /// workspace paths out of the diagnostics.
    fn program_command(&self, workspace: &Path) -> SandboxCommand {
        let mut command = self
            .toolchain(workspace)
            .args(self.flags.iter().cloned())
            .args(["-o", EXECUTABLE_FILE, self.source_file]);
        if self.language == Language::C {
            command = command.arg("-lm");
        }
        command
    }

    /// C solution to an object file, recording its prototypes.
    fn object_command(&self, workspace: &Path) -> SandboxCommand {
        self.toolchain(workspace)
            .args(self.flags.iter().cloned())
            .arg(format!("-Dmain={USER_MAIN}"))
            .args(["-c", "-o", OBJECT_FILE, "-aux-info", PROTOTYPES_FILE, self.source_file])
    }

    fn harness_command(&self, workspace: &Path) -> SandboxCommand {
        match self.language {
            Language::C => self
                .toolchain(workspace)
                .args(HARNESS_FLAGS)
                .args(["-o", EXECUTABLE_FILE, HARNESS_MAIN, OBJECT_FILE, "-lstdc++", "-lm"]),
            _ => self
                .toolchain(workspace)
                .args(self.flags.iter().cloned())
                .args(["-o", EXECUTABLE_FILE, HARNESS_MAIN]),
        }
    }

    async fn compile(&self, command: SandboxCommand) -> Result<(), PrepareError> {
        let outcome = self.sandbox.execute(&command, "", &self.compile_limits).await?;
        tracing::debug!(
            wall_ms = outcome.wall_time_ms,
            rss = outcome.memory_used_bytes,
            "Compiler finished"
        );
        preparation_result(outcome, None)
    }

    /// Builds the args-mode executable and returns the generated main file.
    async fn build_harnessed(&self, workspace: &Path, entry_point: &str) -> Result<PathBuf, PrepareError> {
        fs::write(workspace.join(HARNESS_HEADER), HARNESS).await?;
        let main = match self.language {
            Language::C => {
                self.compile(self.object_command(workspace)).await?;
                let prototypes = fs::read_to_string(workspace.join(PROTOTYPES_FILE))
                    .await
                    .unwrap_or_default();
                let Some(declaration) = entry_declaration(&prototypes, self.source_file, entry_point) else {
                    return Err(PrepareError::CompilationFailed {
                        diagnostics: format!("{}: entry point `{entry_point}` is not defined\n", self.source_file),
                    });
                };
                c_main(&declaration, entry_point)
            }
            _ => cpp_main(self.source_file, entry_point),
        };
        let main_path = workspace.join(HARNESS_MAIN);
        fs::write(&main_path, main).await?;
        self.compile(self.harness_command(workspace)).await?;
        Ok(main_path)
    }
}

fn cpp_main(source_file: &str, entry_point: &str) -> String {
    format!(
        "#include \"{HARNESS_HEADER}\"\n\
         #define main {USER_MAIN}\n\
         #include \"{source_file}\"\n\
         #undef main\n\n\
         signed main() {{ return codejudge::run(&{entry_point}); }}\n"
    )
}

fn c_main(declaration: &str, entry_point: &str) -> String {
    format!(
        "#include \"{HARNESS_HEADER}\"\n\n\
         #define _Bool bool\n\
         #define restrict __restrict\n\
         extern \"C\" {declaration};\n\
         #undef restrict\n\
         #undef _Bool\n\n\
         signed main() {{ return codejudge::run(&{entry_point}); }}\n"
    )
}

/// Finds the prototype `gcc -aux-info` recorded for the definition of
/// `entry_point` in `source_file`. Lines look like
/// `/* solution.c:3:NF */ extern int solve (int a, int b); /* ... */`,
/// where `F` marks a definition.
fn entry_declaration(prototypes: &str, source_file: &str, entry_point: &str) -> Option<String> {
    let origin = format!("/* {source_file}:");
    let name = Regex::new(&format!(r"\b{}\s*\(", regex::escape(entry_point))).ok()?;
    prototypes.lines().find_map(|line| {
        let (location, rest) = line.strip_prefix(&origin)?.split_once("*/")?;
        let flags = location.trim().rsplit(':').next()?;
        if !flags.contains('F') {
            return None;
        }
        let declaration = rest.split(';').next()?.trim();
        if !name.is_match(declaration) {
            return None;
        }
        Some(declaration.strip_prefix("extern ").unwrap_or(declaration).to_string())
    })
}

#[async_trait::async_trait]
impl LanguageExecutor for GccExecutor {
    fn language(&self) -> Language {
        self.language
    }

    fn supports(&self, _mode: InputMode) -> bool {
        true
    }

    #[tracing::instrument(skip(self, source), fields(language = %self.language))]
    async fn prepare(
        &self,
        workspace: &Path,
        source: &str,
        entry_point: &str,
        mode: InputMode,
    ) -> Result<Artifact, PrepareError> {
        fs::write(workspace.join(self.source_file), source).await?;
        let harness = match mode {
            InputMode::Stdin => {
                self.compile(self.program_command(workspace)).await?;
                None
            }
            InputMode::Args => Some(self.build_harnessed(workspace, entry_point).await?),
        };

        let executable = workspace.join(EXECUTABLE_FILE);
        if !fs::try_exists(&executable).await? {
            return Err(PrepareError::MissingArtifact(executable));
        }

        Ok(Artifact {
            id: Uuid::new_v4(),
            language: self.language,
            mode,
            kind: ArtifactKind::Executable,
            path: executable,
            harness,
            entry_point: entry_point.to_string(),
        })
    }

    async fn run(
        &self,
        artifact: &Artifact,
        cwd: &Path,
        stdin: &str,
        limits: &ResourceProfile,
        ledger: Option<MemoryLedger>,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let command = SandboxCommand::new(&artifact.path, cwd)
            .readable(artifact.path.parent().unwrap_or(cwd))
            .with_address_space_limit(true)
            .with_memory_ledger(ledger);
        self.sandbox.execute(&command, stdin, limits).await
    }

    fn classify_exit(&self, artifact: &Artifact, outcome: &ExecutionOutcome) -> ProgramExit {
        exit_class(outcome, artifact.harness.is_some(), Some(FATAL_OOM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SandboxConfig,
        constants::HARNESS_MEMORY_EXIT,
        core::{
            domain::{CompilationLimitType, LimitKind},
            traits::sandbox::MockSandbox,
        },
        native::{sandbox::ProcessSandbox, workspace::Workspace},
    };

    fn compiler_path(variable: &str, default: &str) -> Option<PathBuf> {
        let path = PathBuf::from(std::env::var(variable).unwrap_or_else(|_| default.to_string()));
        path.exists().then_some(path)
    }

    fn gnucpp_path() -> Option<PathBuf> {
        compiler_path("GNUCPP_PATH", "/usr/bin/g++")
    }

    fn gnuc_path() -> Option<PathBuf> {
        compiler_path("GNUC_PATH", "/usr/bin/gcc")
    }

    async fn workspace() -> Workspace {
        Workspace::create(&std::env::temp_dir().join("codejudge_gcc_tests"))
            .await
            .unwrap()
    }

    fn compiled() -> Result<ExecutionOutcome, SandboxError> {
        Ok(ExecutionOutcome {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    const CORRECT_CODE: &str = "
        #include <iostream>
        int main() {
            long long a, b;
            std::cin >> a >> b;
            std::cout << a + b << std::endl;
            return 0;
        }";

    const INCORRECT_CODE: &str = "
        #include <iostream>
        int main() {
            std::cout << \"Hello, World!\" << std::endl
            return 0;
        }";

    const PROTOTYPES: &str = "\
/* /usr/include/stdio.h:356:NC */ extern int printf (const char *, ...);
/* solution.c:2:NF */ static int helper (int x); /* (x) int x; */
/* solution.c:4:NF */ extern int *doubled (int *nums, int numsSize, int *returnSize); /* (nums, numsSize, returnSize) */
/* solution.c:9:NF */ extern int codejudge_user_main (void); /* () */
";

    #[tokio::test]
    async fn test_compile_command_uses_relative_names() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|command, _, limits| {
                command.program == Path::new("gcc")
                    && command.args == ["-std=c11", "-O2", "-pipe", "-o", "solution", "solution.c", "-lm"]
                    && limits.wall_timeout_ms == 9_000
            })
            .returning(|_, _, _| compiled());
        let executor = GccExecutor::c(
            Arc::new(sandbox),
            &LanguageConfig::default(),
            ResourceProfile {
                wall_timeout_ms: 9_000,
                ..ResourceProfile::default()
            },
        );

        // The mock compiler produces nothing.
        let workspace = workspace().await;
        let result = executor
            .prepare(workspace.path(), "int main(void) { return 0; }", "solution", InputMode::Stdin)
            .await;
        assert!(matches!(result, Err(PrepareError::MissingArtifact(_))));
    }

    #[tokio::test]
    async fn test_cpp_args_mode_includes_solution_under_harness() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .times(1)
            .withf(|command, _, _| {
                command.program == Path::new("g++")
                    && command.args == ["-std=c++17", "-O2", "-pipe", "-o", "solution", "harness_main.cpp"]
            })
            .returning(|command, _, _| {
                std::fs::write(command.cwd.join(EXECUTABLE_FILE), "").unwrap();
                compiled()
            });
        let executor = GccExecutor::cpp(Arc::new(sandbox), &LanguageConfig::default(), ResourceProfile::default());

        let workspace = workspace().await;
        let artifact = executor
            .prepare(workspace.path(), "int solve(int a, int b) { return a + b; }", "solve", InputMode::Args)
            .await
            .unwrap();

        let main_path = artifact.harness.clone().unwrap();
        assert_eq!(main_path, workspace.path().join(HARNESS_MAIN));
        let main = std::fs::read_to_string(&main_path).unwrap();
        assert!(main.contains("#include \"solution.cpp\""));
        assert!(main.contains("codejudge::run(&solve)"));
        assert!(workspace.path().join(HARNESS_HEADER).exists());
    }

    #[tokio::test]
    async fn test_c_args_mode_declares_recorded_prototype() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().times(2).returning(|command, _, _| {
            if command.args.iter().any(|a| a == "-aux-info") {
                assert!(command.args.contains(&format!("-Dmain={USER_MAIN}")));
                std::fs::write(command.cwd.join(PROTOTYPES_FILE), PROTOTYPES).unwrap();
            } else {
                assert_eq!(
                    command.args,
                    ["-std=c++17", "-O2", "-pipe", "-o", "solution", "harness_main.cpp", "solution.o", "-lstdc++", "-lm"]
                );
                std::fs::write(command.cwd.join(EXECUTABLE_FILE), "").unwrap();
            }
            compiled()
        });
        let executor = GccExecutor::c(Arc::new(sandbox), &LanguageConfig::default(), ResourceProfile::default());

        let workspace = workspace().await;
        let artifact = executor
            .prepare(workspace.path(), "int *doubled(int *nums, int numsSize, int *returnSize);", "doubled", InputMode::Args)
            .await
            .unwrap();

        let main = std::fs::read_to_string(artifact.harness.unwrap()).unwrap();
        assert!(main.contains("extern \"C\" int *doubled (int *nums, int numsSize, int *returnSize);"));
        assert!(main.contains("codejudge::run(&doubled)"));
    }

    #[tokio::test]
    async fn test_c_args_mode_without_entry_point_fails_compilation() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().times(1).returning(|command, _, _| {
            std::fs::write(command.cwd.join(PROTOTYPES_FILE), PROTOTYPES).unwrap();
            compiled()
        });
        let executor = GccExecutor::c(Arc::new(sandbox), &LanguageConfig::default(), ResourceProfile::default());

        let workspace = workspace().await;
        let result = executor
            .prepare(workspace.path(), "int other(void) { return 0; }", "solve", InputMode::Args)
            .await;
        match result {
            Err(PrepareError::CompilationFailed { diagnostics }) => assert!(diagnostics.contains("`solve`")),
            other => panic!("expected compilation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_declaration_takes_definitions_only() {
        assert_eq!(
            entry_declaration(PROTOTYPES, "solution.c", "doubled").as_deref(),
            Some("int *doubled (int *nums, int numsSize, int *returnSize)")
        );
        assert_eq!(
            entry_declaration(PROTOTYPES, "solution.c", "helper").as_deref(),
            Some("static int helper (int x)")
        );
        assert_eq!(entry_declaration(PROTOTYPES, "solution.c", "printf"), None);
        assert_eq!(entry_declaration(PROTOTYPES, "solution.c", "double"), None);
    }

    #[tokio::test]
    async fn test_compile_memory_breach() {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|_, _, _| {
            Ok(ExecutionOutcome {
                limit_exceeded: Some(LimitKind::Memory),
                signal: Some(libc::SIGKILL),
                ..Default::default()
            })
        });
        let executor = GccExecutor::cpp(Arc::new(sandbox), &LanguageConfig::default(), ResourceProfile::default());
        let workspace = workspace().await;
        let result = executor
            .prepare(workspace.path(), CORRECT_CODE, "solution", InputMode::Stdin)
            .await;
        assert!(matches!(
            result,
            Err(PrepareError::CompilationLimitsExceeded(CompilationLimitType::Ram))
        ));
    }

    #[tokio::test]
    async fn test_run_exposes_artifact_directory() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|command, _, _| {
                command.program == Path::new("/ws/solution")
                    && command.readable == [PathBuf::from("/ws")]
                    && command.address_space_limit
            })
            .returning(|_, _, _| compiled());
        let executor = GccExecutor::cpp(Arc::new(sandbox), &LanguageConfig::default(), ResourceProfile::default());
        let artifact = Artifact {
            id: Uuid::new_v4(),
            language: Language::Cpp,
            mode: InputMode::Stdin,
            kind: ArtifactKind::Executable,
            path: PathBuf::from("/ws/solution"),
            harness: None,
            entry_point: "solution".to_string(),
        };
        executor
            .run(&artifact, Path::new("/ws/run_0"), "", &ResourceProfile::default(), None)
            .await
            .unwrap();
    }

    fn real_executor(language: Language, compiler: PathBuf) -> GccExecutor {
        let sandbox = ProcessSandbox::new(SandboxConfig::unconfined());
        let config = LanguageConfig {
            program: Some(compiler),
            ..LanguageConfig::default()
        };
        let limits = ResourceProfile {
            wall_timeout_ms: 60_000,
            cpu_time_ms: 60_000,
            memory_limit_bytes: 1024 * 1024 * 1024,
            max_output_bytes: 256 * 1024,
        };
        match language {
            Language::C => GccExecutor::c(Arc::new(sandbox), &config, limits),
            _ => GccExecutor::cpp(Arc::new(sandbox), &config, limits),
        }
    }

    async fn run_once(executor: &GccExecutor, workspace: &Workspace, artifact: &Artifact, index: usize, stdin: &str) -> ExecutionOutcome {
        let run_dir = workspace.create_run_dir(index).await.unwrap();
        executor
            .run(artifact, &run_dir, stdin, &ResourceProfile::default(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_compile_and_run_success() {
        let Some(compiler) = gnucpp_path() else {
            eprintln!("g++ not found, skipping");
            return;
        };
        let executor = real_executor(Language::Cpp, compiler);
        let workspace = workspace().await;

        let artifact = executor
            .prepare(workspace.path(), CORRECT_CODE, "solution", InputMode::Stdin)
            .await
            .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Executable);

        let outcome = run_once(&executor, &workspace, &artifact, 0, "2 3\n").await;
        assert_eq!(outcome.stdout, "5\n");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_compile_code_error() {
        let Some(compiler) = gnucpp_path() else {
            eprintln!("g++ not found, skipping");
            return;
        };
        let executor = real_executor(Language::Cpp, compiler);
        let workspace = workspace().await;

        let result = executor
            .prepare(workspace.path(), INCORRECT_CODE, "solution", InputMode::Stdin)
            .await;
        match result {
            Err(PrepareError::CompilationFailed { diagnostics }) => {
                assert!(diagnostics.contains("solution.cpp"));
                assert!(!diagnostics.contains(&workspace.path().display().to_string()));
            }
            other => panic!("expected compilation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cpp_args_mode_round_trip() {
        let Some(compiler) = gnucpp_path() else {
            eprintln!("g++ not found, skipping");
            return;
        };
        let executor = real_executor(Language::Cpp, compiler);
        let workspace = workspace().await;
        let source = r#"
            #include <iostream>
            #include <string>
            #include <vector>
            std::vector<std::string> label(const std::vector<int>& xs, const std::string& tag) {
                std::cout << "debug: " << xs.size() << std::endl;
                std::vector<std::string> out;
                for (int x : xs) out.push_back(tag + std::to_string(x * 2));
                return out;
            }
            int main() { return 7; }
        "#;

        let artifact = executor
            .prepare(workspace.path(), source, "label", InputMode::Args)
            .await
            .unwrap();
        let outcome = run_once(&executor, &workspace, &artifact, 0, r#"[[1,2],"n\"x"]"#).await;
        assert_eq!(outcome.stdout, "[\"n\\\"x2\",\"n\\\"x4\"]\n");
        assert!(outcome.stderr.contains("debug: 2"));
        assert_eq!(executor.classify_exit(&artifact, &outcome), ProgramExit::Clean);

        let outcome = run_once(&executor, &workspace, &artifact, 1, "[[1], 2]").await;
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(executor.classify_exit(&artifact, &outcome), ProgramExit::Exception);
    }

    #[tokio::test]
    async fn test_c_args_mode_round_trip() {
        let Some(compiler) = gnuc_path() else {
            eprintln!("gcc not found, skipping");
            return;
        };
        if gnucpp_path().is_none() {
            eprintln!("g++ not found, skipping");
            return;
        }
        let executor = real_executor(Language::C, compiler);
        let workspace = workspace().await;
        let source = r#"
            #include <stdio.h>
            #include <stdlib.h>
            int *doubled(int *nums, int numsSize, int *returnSize) {
                printf("debug\n");
                int *out = malloc(sizeof(int) * numsSize);
                for (int i = 0; i < numsSize; i++) out[i] = nums[i] * 2;
                *returnSize = numsSize;
                return out;
            }
        "#;

        let artifact = executor
            .prepare(workspace.path(), source, "doubled", InputMode::Args)
            .await
            .unwrap();
        let outcome = run_once(&executor, &workspace, &artifact, 0, "[[1,2,3]]").await;
        assert_eq!(outcome.stdout, "[2,4,6]\n");
        assert_eq!(outcome.stderr, "debug\n");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn test_harness_reserves_exit_statuses() {
        assert!(HARNESS.contains("EXCEPTION_EXIT = 1;"));
        assert!(HARNESS.contains(&format!("MEMORY_EXIT = {HARNESS_MEMORY_EXIT};")));
    }

    #[test]
    fn test_classify_exit_uses_status_not_stderr() {
        let executor = GccExecutor::cpp(Arc::new(MockSandbox::new()), &LanguageConfig::default(), ResourceProfile::default());
        let mut artifact = Artifact {
            id: Uuid::new_v4(),
            language: Language::Cpp,
            mode: InputMode::Args,
            kind: ArtifactKind::Executable,
            path: PathBuf::from("/ws/solution"),
            harness: Some(PathBuf::from("/ws/harness_main.cpp")),
            entry_point: "solve".to_string(),
        };

        let chatty = ExecutionOutcome {
            stdout: "3\n".to_string(),
            stderr: "terminate called after throwing an instance of 'std::out_of_range'\n".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(executor.classify_exit(&artifact, &chatty), ProgramExit::Clean);

        let reported = ExecutionOutcome {
            exit_code: Some(HARNESS_MEMORY_EXIT),
            ..Default::default()
        };
        assert_eq!(executor.classify_exit(&artifact, &reported), ProgramExit::OutOfMemory);

        let aborted = ExecutionOutcome {
            stderr: "terminate called after throwing an instance of 'std::bad_alloc'\n  what():  std::bad_alloc\n".to_string(),
            signal: Some(libc::SIGABRT),
            ..Default::default()
        };
        assert_eq!(executor.classify_exit(&artifact, &aborted), ProgramExit::OutOfMemory);

        // Without the harness the program owns its exit status.
        artifact.mode = InputMode::Stdin;
        artifact.harness = None;
        assert_eq!(executor.classify_exit(&artifact, &reported), ProgramExit::Exception);
    }
}
