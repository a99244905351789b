/// File name the embedded worker runner is written under in the datadir.
pub const RUNNER_FILE_NAME: &str = "__runway_worker__.py";

/// The minimal Python runner a worker subprocess executes. It reads one JSON
/// request per stdin line and answers with a terminal JSON line carrying
/// `result` or `error`; everything the action prints in between streams
/// through as plain lines. The server never imports user code itself.
pub const RUNNER_PY: &str = r#"import importlib.util
import json
import os
import sys
import traceback


def _load_module(path):
    name = "__runway_action__" + os.path.splitext(os.path.basename(path))[0]
    spec = importlib.util.spec_from_file_location(name, path)
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    return module


def _jsonable(value):
    try:
        json.dumps(value)
        return value
    except (TypeError, ValueError):
        pass
    for attr in ("model_dump", "dict"):
        fn = getattr(value, attr, None)
        if callable(fn):
            try:
                return fn()
            except Exception:
                pass
    return str(value)


def _emit(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()


def _handle(request):
    file_path = request["file"]
    action_name = request["action_name"]
    artifacts_dir = request.get("artifacts_dir")
    if artifacts_dir:
        os.makedirs(artifacts_dir, exist_ok=True)
        os.chdir(artifacts_dir)

    module = _load_module(file_path)
    fn = getattr(module, action_name, None)
    if fn is None:
        raise RuntimeError("action %r not found in %s" % (action_name, file_path))

    kwargs = dict(request.get("inputs") or {})
    kwargs.update(request.get("managed_params") or {})
    result = fn(**kwargs)
    return _jsonable(result)


def main():
    _emit({"ready": True})
    for line in sys.stdin:
        line = line.strip()
        if not line:
            continue
        try:
            request = json.loads(line)
        except ValueError:
            _emit({"error": "malformed request line"})
            continue
        try:
            _emit({"result": _handle(request)})
        except Exception as exc:  # noqa: BLE001 - everything maps to a failed run
            traceback.print_exc(file=sys.stderr)
            _emit({"error": str(exc)})


if __name__ == "__main__":
    main()
"#;
